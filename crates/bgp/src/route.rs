//! Routes and their translation into UPDATE messages.

use crate::message::prefix::encoded_len;
use crate::message::{
    AddressFamily, AsSegment, MAX_MESSAGE_LEN, Message, MpReach, MpUnreach, Origin, PathAttribute,
    Update,
};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// LOCAL_PREF sent on iBGP sessions when the route does not set one.
pub const DEFAULT_LOCAL_PREF: u32 = 100;

/// Largest MP_REACH_NLRI overhead without prefixes: attribute header (4),
/// AFI/SAFI (3), next-hop length (1), two IPv6 next hops (32), reserved (1).
const MP_REACH_OVERHEAD: usize = 41;

/// A prefix to advertise and the attributes it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Advertised prefix
    pub prefix: IpNet,
    /// LOCAL_PREF for iBGP peers
    pub local_pref: Option<u32>,
    /// COMMUNITIES, sorted
    pub communities: Vec<u32>,
    /// Peer names allowed to receive the route; empty means all
    pub peers: Vec<String>,
}

impl Route {
    /// A route with no extra attributes, sent to every peer.
    #[must_use]
    pub fn new(prefix: IpNet) -> Self {
        Self {
            prefix,
            local_pref: None,
            communities: Vec::new(),
            peers: Vec::new(),
        }
    }

    /// Address family of the prefix.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        match self.prefix {
            IpNet::V4(_) => AddressFamily::Ipv4Unicast,
            IpNet::V6(_) => AddressFamily::Ipv6Unicast,
        }
    }

    /// Whether the peer named `peer` should receive this route.
    #[must_use]
    pub fn applies_to(&self, peer: &str) -> bool {
        self.peers.is_empty() || self.peers.iter().any(|p| p == peer)
    }

    /// Folds a second route for the same prefix into this one.
    ///
    /// Communities and peer filters are unioned (an unfiltered route wins);
    /// the first LOCAL_PREF set is kept.
    pub fn merge(&mut self, other: &Route) {
        self.communities.extend(other.communities.iter().copied());
        self.communities.sort_unstable();
        self.communities.dedup();

        if self.peers.is_empty() || other.peers.is_empty() {
            self.peers.clear();
        } else {
            self.peers.extend(other.peers.iter().cloned());
            self.peers.sort();
            self.peers.dedup();
        }

        if self.local_pref.is_none() {
            self.local_pref = other.local_pref;
        }
    }
}

/// Session-specific values the path attributes are built from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathContext {
    pub(crate) local_asn: u32,
    pub(crate) ibgp: bool,
    pub(crate) four_octet_as: bool,
    pub(crate) next_hop: IpAddr,
}

impl PathContext {
    fn attributes(&self, local_pref: Option<u32>, communities: &[u32]) -> Vec<PathAttribute> {
        let as_path = if self.ibgp {
            Vec::new()
        } else {
            vec![AsSegment::sequence(vec![self.local_asn])]
        };
        let mut attributes = vec![
            PathAttribute::Origin(Origin::Incomplete),
            PathAttribute::AsPath(as_path),
        ];
        if let IpAddr::V4(next_hop) = self.next_hop {
            attributes.push(PathAttribute::NextHop(next_hop));
        }
        if self.ibgp {
            attributes.push(PathAttribute::LocalPref(local_pref.unwrap_or(DEFAULT_LOCAL_PREF)));
        }
        if !communities.is_empty() {
            attributes.push(PathAttribute::Communities(communities.to_vec()));
        }
        attributes
    }

    /// Room left for prefixes once the header and `attributes` are counted.
    fn prefix_budget(&self, attributes: Vec<PathAttribute>) -> usize {
        let probe = Message::Update(Update { attributes, ..Update::default() });
        let used = probe
            .to_bytes(self.four_octet_as)
            .map_or(MAX_MESSAGE_LEN, |bytes| bytes.len());
        MAX_MESSAGE_LEN
            .saturating_sub(used)
            .saturating_sub(MP_REACH_OVERHEAD)
    }
}

/// Splits `prefixes` into runs whose encoded size stays within `budget`.
fn chunk(prefixes: &[IpNet], budget: usize) -> Vec<Vec<IpNet>> {
    let mut chunks = Vec::new();
    let mut current: Vec<IpNet> = Vec::new();
    let mut size = 0;
    for prefix in prefixes {
        let len = encoded_len(prefix);
        if !current.is_empty() && size + len > budget {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        current.push(*prefix);
        size += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Builds the UPDATEs for one batch: withdrawals first, then announcements
/// grouped by identical attributes.
pub(crate) fn build_updates(ctx: &PathContext, withdraw: &[IpNet], advertise: &[Route]) -> Vec<Update> {
    let mut updates = Vec::new();

    let (withdraw_v4, withdraw_v6): (Vec<IpNet>, Vec<IpNet>) =
        withdraw.iter().copied().partition(|p| matches!(p, IpNet::V4(_)));
    let budget = ctx.prefix_budget(Vec::new());
    for withdrawn in chunk(&withdraw_v4, budget) {
        updates.push(Update { withdrawn, ..Update::default() });
    }
    for withdrawn in chunk(&withdraw_v6, budget) {
        updates.push(Update {
            attributes: vec![PathAttribute::MpUnreach(MpUnreach {
                family: AddressFamily::Ipv6Unicast,
                withdrawn,
            })],
            ..Update::default()
        });
    }

    let mut groups: BTreeMap<(bool, Option<u32>, &[u32]), Vec<IpNet>> = BTreeMap::new();
    for route in advertise {
        let v6 = matches!(route.prefix, IpNet::V6(_));
        groups
            .entry((v6, route.local_pref, route.communities.as_slice()))
            .or_default()
            .push(route.prefix);
    }
    for ((v6, local_pref, communities), prefixes) in groups {
        let attributes = ctx.attributes(local_pref, communities);
        let budget = ctx.prefix_budget(attributes.clone());
        for nlri in chunk(&prefixes, budget) {
            let mut attributes = attributes.clone();
            if v6 {
                attributes.push(PathAttribute::MpReach(MpReach {
                    family: AddressFamily::Ipv6Unicast,
                    next_hops: vec![ctx.next_hop],
                    nlri,
                }));
                updates.push(Update { attributes, ..Update::default() });
            } else {
                updates.push(Update { attributes, nlri, ..Update::default() });
            }
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::update::{ATTR_LOCAL_PREF, ATTR_NEXT_HOP};

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ebgp() -> PathContext {
        PathContext {
            local_asn: 64512,
            ibgp: false,
            four_octet_as: true,
            next_hop: "192.0.2.10".parse().unwrap(),
        }
    }

    #[test]
    fn test_merge() {
        let mut a = Route::new(net("10.0.0.1/32"));
        a.communities = vec![5, 1];
        a.peers = vec!["b".to_string()];
        let mut b = Route::new(net("10.0.0.1/32"));
        b.communities = vec![1, 3];
        b.peers = vec!["a".to_string()];
        b.local_pref = Some(200);
        a.merge(&b);
        assert_eq!(a.communities, vec![1, 3, 5]);
        assert_eq!(a.peers, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a.local_pref, Some(200));

        a.merge(&Route::new(net("10.0.0.1/32")));
        assert!(a.peers.is_empty());
        assert!(a.applies_to("anyone"));
    }

    #[test]
    fn test_ebgp_attributes() {
        let updates = build_updates(&ebgp(), &[], &[Route::new(net("10.0.0.1/32"))]);
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.nlri, vec![net("10.0.0.1/32")]);
        assert_eq!(update.as_path(), Some(vec![64512]));
        assert_eq!(update.local_pref(), None);
        assert_eq!(
            update.attribute(ATTR_NEXT_HOP),
            Some(&PathAttribute::NextHop("192.0.2.10".parse().unwrap()))
        );
        assert_eq!(update.attributes[0], PathAttribute::Origin(Origin::Incomplete));
    }

    #[test]
    fn test_ibgp_attributes() {
        let ctx = PathContext { ibgp: true, ..ebgp() };
        let mut with_pref = Route::new(net("10.0.0.2/32"));
        with_pref.local_pref = Some(250);
        let updates = build_updates(&ctx, &[], &[Route::new(net("10.0.0.1/32")), with_pref]);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].as_path(), Some(vec![]));
        assert_eq!(updates[0].attribute(ATTR_LOCAL_PREF), Some(&PathAttribute::LocalPref(100)));
        assert_eq!(updates[1].local_pref(), Some(250));
    }

    #[test]
    fn test_withdrawals_come_first_and_routes_are_grouped() {
        let mut tagged = Route::new(net("10.0.0.3/32"));
        tagged.communities = vec![0xFDE8_0001];
        let routes = vec![
            Route::new(net("10.0.0.1/32")),
            tagged,
            Route::new(net("10.0.0.2/32")),
        ];
        let updates = build_updates(&ebgp(), &[net("10.0.0.9/32")], &routes);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].withdrawn, vec![net("10.0.0.9/32")]);
        assert!(updates[0].attributes.is_empty());
        assert_eq!(updates[1].nlri, vec![net("10.0.0.1/32"), net("10.0.0.2/32")]);
        assert_eq!(updates[2].nlri, vec![net("10.0.0.3/32")]);
        assert_eq!(updates[2].communities(), vec![0xFDE8_0001]);
    }

    #[test]
    fn test_ipv6_uses_multiprotocol_attributes() {
        let ctx = PathContext { next_hop: "2001:db8::10".parse().unwrap(), ..ebgp() };
        let updates = build_updates(
            &ctx,
            &[net("2001:db8:1::9/128")],
            &[Route::new(net("2001:db8:1::1/128"))],
        );
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].withdrawn_all(), vec![net("2001:db8:1::9/128")]);
        assert!(updates[1].nlri.is_empty());
        assert_eq!(updates[1].announced(), vec![net("2001:db8:1::1/128")]);
        assert!(updates[1].attribute(ATTR_NEXT_HOP).is_none());
    }

    #[test]
    fn test_large_batches_fit_in_messages() {
        let routes: Vec<Route> = (0..2000u32)
            .map(|i| {
                let ip = IpAddr::from(std::net::Ipv4Addr::from(0x0A00_0000 + i));
                Route::new(IpNet::new(ip, 32).unwrap())
            })
            .collect();
        let updates = build_updates(&ebgp(), &[], &routes);
        assert!(updates.len() > 1);
        let total: usize = updates.iter().map(|u| u.nlri.len()).sum();
        assert_eq!(total, 2000);
        for update in updates {
            let bytes = Message::Update(update).to_bytes(true).unwrap();
            assert!(bytes.len() <= MAX_MESSAGE_LEN);
        }
    }
}
