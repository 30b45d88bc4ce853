//! Conversion of resources into [`ipam::PoolConfig`] and [`bgp::PeerConfig`].
//!
//! Syntax of ranges and communities is checked later by [`ipam::parse_pool`];
//! this module only resolves references between resources and parses the
//! peer fields the BGP crate takes as typed values.

use crate::bgp_advertisement::BGPAdvertisement;
use crate::bgp_peer::BGPPeer;
use crate::error::ConversionError;
use crate::ip_address_pool::IPAddressPool;
use bgp::PeerConfig;
use bgp::peer::{DEFAULT_HOLD_TIME, DEFAULT_PORT};
use ipam::{BgpAdvertisementConfig, PoolConfig, Protocol};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn name_of(meta: &ObjectMeta, kind: &'static str) -> Result<String, ConversionError> {
    meta.name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or(ConversionError::MissingName(kind))
}

/// Builds pool configurations in declaration order.
///
/// Pools selected by an advertisement are BGP pools carrying every
/// advertisement that selects them; the rest are layer2 pools.
pub fn pool_configs(
    pools: &[IPAddressPool],
    advertisements: &[BGPAdvertisement],
) -> Result<Vec<PoolConfig>, ConversionError> {
    let names = pools
        .iter()
        .map(|pool| name_of(&pool.metadata, "IPAddressPool"))
        .collect::<Result<Vec<_>, _>>()?;

    let declared: HashSet<&str> = names.iter().map(String::as_str).collect();
    for advertisement in advertisements {
        let adv_name = name_of(&advertisement.metadata, "BGPAdvertisement")?;
        if let Some(pool) = advertisement
            .spec
            .ip_address_pools
            .iter()
            .find(|pool| !declared.contains(pool.as_str()))
        {
            return Err(ConversionError::UnknownPool {
                advertisement: adv_name,
                pool: pool.clone(),
            });
        }
    }

    Ok(pools
        .iter()
        .zip(names)
        .map(|(pool, name)| {
            let bgp_advertisements: Vec<BgpAdvertisementConfig> = advertisements
                .iter()
                .filter(|adv| adv.spec.selects_pool(&name))
                .map(|adv| BgpAdvertisementConfig {
                    aggregation_length: adv.spec.aggregation_length,
                    aggregation_length_v6: adv.spec.aggregation_length_v6,
                    local_pref: adv.spec.local_pref,
                    communities: adv.spec.communities.clone(),
                    peers: adv.spec.peers.clone(),
                })
                .collect();
            PoolConfig {
                name,
                protocol: if bgp_advertisements.is_empty() {
                    Protocol::Layer2
                } else {
                    Protocol::Bgp
                },
                addresses: pool.spec.addresses.clone(),
                auto_assign: pool.spec.auto_assign,
                avoid_buggy_ips: pool.spec.avoid_buggy_ips,
                bgp_advertisements,
            }
        })
        .collect())
}

/// Builds one peer configuration per resource, in declaration order.
pub fn peer_configs(peers: &[BGPPeer]) -> Result<Vec<PeerConfig>, ConversionError> {
    peers.iter().map(peer_config).collect()
}

/// Builds the configuration of one peer.
pub fn peer_config(peer: &BGPPeer) -> Result<PeerConfig, ConversionError> {
    let name = name_of(&peer.metadata, "BGPPeer")?;
    let spec = &peer.spec;

    if spec.my_asn == 0 || spec.peer_asn == 0 {
        return Err(ConversionError::InvalidAsn(name));
    }

    let invalid = |field: &'static str, value: &str, reason: String| ConversionError::InvalidAddress {
        peer: name.clone(),
        field,
        value: value.to_string(),
        reason,
    };

    let address: IpAddr = spec
        .peer_address
        .trim()
        .parse()
        .map_err(|e: std::net::AddrParseError| invalid("peerAddress", &spec.peer_address, e.to_string()))?;

    let source_address = match &spec.source_address {
        Some(text) => {
            let source: IpAddr = text
                .trim()
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("sourceAddress", text, e.to_string()))?;
            if source.is_ipv4() != address.is_ipv4() {
                return Err(invalid(
                    "sourceAddress",
                    text,
                    "family differs from peerAddress".to_string(),
                ));
            }
            Some(source)
        }
        None => None,
    };

    let router_id = match &spec.router_id {
        Some(text) => {
            let id: Ipv4Addr = text
                .trim()
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("routerID", text, e.to_string()))?;
            if id.is_unspecified() {
                return Err(invalid("routerID", text, "must not be 0.0.0.0".to_string()));
            }
            Some(id)
        }
        None => None,
    };

    let hold_time = match &spec.hold_time {
        Some(text) => parse_hold_time(&name, text)?,
        None => DEFAULT_HOLD_TIME,
    };

    Ok(PeerConfig {
        local_asn: spec.my_asn,
        peer_asn: spec.peer_asn,
        address,
        port: spec.peer_port.unwrap_or(DEFAULT_PORT),
        source_address,
        hold_time,
        router_id,
        password: spec.password.clone().filter(|p| !p.is_empty()),
        node_selectors: spec
            .node_selectors
            .iter()
            .map(|selector| selector.match_labels.clone())
            .collect(),
        name,
    })
}

/// Parses a hold time: whole seconds, 0 or between 3 and 65535.
fn parse_hold_time(peer: &str, text: &str) -> Result<Duration, ConversionError> {
    let invalid = |reason: String| ConversionError::InvalidHoldTime {
        peer: peer.to_string(),
        value: text.to_string(),
        reason,
    };
    let hold = humantime::parse_duration(text.trim()).map_err(|e| invalid(e.to_string()))?;
    if hold.subsec_nanos() != 0 {
        return Err(invalid("must be whole seconds".to_string()));
    }
    match hold.as_secs() {
        1 | 2 => Err(invalid("must be 0 or at least 3s".to_string())),
        secs if secs > u64::from(u16::MAX) => Err(invalid("must not exceed 65535s".to_string())),
        _ => Ok(hold),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp_advertisement::BGPAdvertisementSpec;
    use crate::bgp_peer::{BGPPeerSpec, NodeSelector};
    use crate::ip_address_pool::IPAddressPoolSpec;
    use std::collections::BTreeMap;

    fn pool(name: &str, addresses: &[&str]) -> IPAddressPool {
        IPAddressPool::new(
            name,
            IPAddressPoolSpec {
                addresses: addresses.iter().map(ToString::to_string).collect(),
                auto_assign: true,
                avoid_buggy_ips: false,
            },
        )
    }

    fn advertisement(name: &str, pools: &[&str]) -> BGPAdvertisement {
        BGPAdvertisement::new(
            name,
            BGPAdvertisementSpec {
                ip_address_pools: pools.iter().map(ToString::to_string).collect(),
                local_pref: Some(200),
                communities: vec!["no-export".to_string()],
                ..BGPAdvertisementSpec::default()
            },
        )
    }

    fn peer(spec: BGPPeerSpec) -> BGPPeer {
        BGPPeer::new("tor", spec)
    }

    fn peer_spec() -> BGPPeerSpec {
        BGPPeerSpec {
            my_asn: 64512,
            peer_asn: 64513,
            peer_address: "10.0.0.254".to_string(),
            ..BGPPeerSpec::default()
        }
    }

    #[test]
    fn test_pool_protocol_follows_advertisements() {
        let pools = vec![pool("a", &["10.0.0.0/24"]), pool("b", &["10.0.1.0/24"])];
        let configs = pool_configs(&pools, &[advertisement("adv", &["b"])]).unwrap();
        assert_eq!(configs[0].name, "a");
        assert_eq!(configs[0].protocol, Protocol::Layer2);
        assert!(configs[0].bgp_advertisements.is_empty());
        assert_eq!(configs[1].protocol, Protocol::Bgp);
        assert_eq!(configs[1].bgp_advertisements[0].local_pref, Some(200));
    }

    #[test]
    fn test_advertisement_without_pools_selects_all() {
        let pools = vec![pool("a", &["10.0.0.0/24"]), pool("b", &["10.0.1.0/24"])];
        let configs = pool_configs(&pools, &[advertisement("adv", &[])]).unwrap();
        assert!(configs.iter().all(|c| c.protocol == Protocol::Bgp));
    }

    #[test]
    fn test_advertisement_unknown_pool() {
        let err = pool_configs(&[pool("a", &["10.0.0.0/24"])], &[advertisement("adv", &["zzz"])])
            .unwrap_err();
        assert_eq!(
            err,
            ConversionError::UnknownPool {
                advertisement: "adv".to_string(),
                pool: "zzz".to_string()
            }
        );
    }

    #[test]
    fn test_pool_without_name() {
        let mut nameless = pool("a", &["10.0.0.0/24"]);
        nameless.metadata.name = None;
        assert_eq!(
            pool_configs(&[nameless], &[]).unwrap_err(),
            ConversionError::MissingName("IPAddressPool")
        );
    }

    #[test]
    fn test_peer_defaults() {
        let config = peer_config(&peer(peer_spec())).unwrap();
        assert_eq!(config.name, "tor");
        assert_eq!(config.port, 179);
        assert_eq!(config.hold_time, Duration::from_secs(90));
        assert!(config.node_selectors.is_empty());
    }

    #[test]
    fn test_peer_full() {
        let spec = BGPPeerSpec {
            peer_port: Some(1179),
            source_address: Some("10.0.0.1".to_string()),
            hold_time: Some("3m".to_string()),
            router_id: Some("1.2.3.4".to_string()),
            password: Some("secret".to_string()),
            node_selectors: vec![NodeSelector {
                match_labels: BTreeMap::from([("rack".to_string(), "r1".to_string())]),
            }],
            ..peer_spec()
        };
        let config = peer_config(&peer(spec)).unwrap();
        assert_eq!(config.port, 1179);
        assert_eq!(config.hold_time, Duration::from_secs(180));
        assert_eq!(config.router_id, Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.node_selectors[0]["rack"], "r1");
    }

    #[test]
    fn test_peer_rejects_bad_fields() {
        let bad_address = BGPPeerSpec {
            peer_address: "router".to_string(),
            ..peer_spec()
        };
        assert!(matches!(
            peer_config(&peer(bad_address)),
            Err(ConversionError::InvalidAddress { field: "peerAddress", .. })
        ));

        let mixed = BGPPeerSpec {
            source_address: Some("fd00::1".to_string()),
            ..peer_spec()
        };
        assert!(matches!(
            peer_config(&peer(mixed)),
            Err(ConversionError::InvalidAddress { field: "sourceAddress", .. })
        ));

        let zero_asn = BGPPeerSpec { my_asn: 0, ..peer_spec() };
        assert_eq!(
            peer_config(&peer(zero_asn)).unwrap_err(),
            ConversionError::InvalidAsn("tor".to_string())
        );
    }

    #[test]
    fn test_hold_time_bounds() {
        assert_eq!(parse_hold_time("p", "0s").unwrap(), Duration::ZERO);
        assert_eq!(parse_hold_time("p", "3s").unwrap(), Duration::from_secs(3));
        assert!(parse_hold_time("p", "2s").is_err());
        assert!(parse_hold_time("p", "1500ms").is_err());
        assert!(parse_hold_time("p", "1day").is_err());
        assert!(parse_hold_time("p", "soon").is_err());
    }
}
