//! # Pool Model
//!
//! Parses administrator pool configuration into validated [`Pool`] values.
//!
//! A pool is an ordered list of address ranges. Each range is either a CIDR
//! or an explicit inclusive `first-last` pair. The order in which ranges and
//! pools are declared is significant: it is the order the allocator scans
//! them in.
//!
//! Usable addresses:
//! - the first (network) address of a CIDR is never handed out, unless the
//!   CIDR is a single host (`/32`, `/128`);
//! - explicit ranges include both endpoints;
//! - with `avoid_buggy_ips`, IPv4 addresses ending in `.0` or `.255` are
//!   skipped everywhere in the pool.

use crate::error::{CommunityError, PoolError};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// How addresses of a pool are announced to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Answer ARP/NDP for the address on the local segment
    #[default]
    Layer2,
    /// Advertise the address to BGP peers
    Bgp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Layer2 => f.write_str("layer2"),
            Protocol::Bgp => f.write_str("bgp"),
        }
    }
}

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpFamily {
    /// Family of an address.
    #[must_use]
    pub fn of(ip: &IpAddr) -> Self {
        if ip.is_ipv4() { IpFamily::V4 } else { IpFamily::V6 }
    }

    /// Address width in bits.
    #[must_use]
    pub fn width(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// A contiguous block of addresses inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressRange {
    /// CIDR block; stored truncated to its network address
    Cidr(IpNet),
    /// Inclusive explicit range, same family on both ends, `first <= last`
    Explicit {
        /// First address of the range
        first: IpAddr,
        /// Last address of the range
        last: IpAddr,
    },
}

impl AddressRange {
    /// Parses `a.b.c.d/len`, `x::/len` or `first-last`.
    ///
    /// `pool` is only used to label errors.
    pub fn parse(pool: &str, text: &str) -> Result<Self, PoolError> {
        let trimmed = text.trim();
        let syntax = |reason: String| PoolError::InvalidRangeSyntax {
            pool: pool.to_string(),
            range: text.to_string(),
            reason,
        };

        if trimmed.contains('/') {
            let net = IpNet::from_str(trimmed).map_err(|e| syntax(e.to_string()))?;
            return Ok(AddressRange::Cidr(net.trunc()));
        }

        let Some((first, last)) = trimmed.split_once('-') else {
            return Err(syntax("expected a CIDR or a first-last range".to_string()));
        };
        let first = IpAddr::from_str(first.trim())
            .map_err(|e| syntax(format!("first address: {e}")))?;
        let last = IpAddr::from_str(last.trim())
            .map_err(|e| syntax(format!("last address: {e}")))?;

        if first.is_ipv4() != last.is_ipv4() {
            return Err(PoolError::FamilyMismatch {
                pool: pool.to_string(),
                range: text.to_string(),
            });
        }
        if last < first {
            return Err(PoolError::ReversedRange {
                pool: pool.to_string(),
                range: text.to_string(),
            });
        }
        Ok(AddressRange::Explicit { first, last })
    }

    /// Address family of the range.
    #[must_use]
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.bounds().0)
    }

    /// First and last address covered, including the CIDR network address.
    #[must_use]
    pub fn bounds(&self) -> (IpAddr, IpAddr) {
        match self {
            AddressRange::Cidr(net) => (net.network(), net.broadcast()),
            AddressRange::Explicit { first, last } => (*first, *last),
        }
    }

    /// Bounds of the addresses that may be handed out, as integers.
    fn usable_bounds(&self) -> (u128, u128) {
        let (first, last) = self.bounds();
        let (lo, hi) = (ip_to_u128(first), ip_to_u128(last));
        match self {
            AddressRange::Cidr(net) if net.prefix_len() < net.max_prefix_len() => (lo + 1, hi),
            _ => (lo, hi),
        }
    }

    /// Smallest prefix length among the CIDR blocks that exactly cover the range.
    ///
    /// For a CIDR this is its own prefix length; explicit ranges are split
    /// into aligned blocks.
    #[must_use]
    pub fn min_prefix_len(&self) -> u8 {
        match self {
            AddressRange::Cidr(net) => net.prefix_len(),
            AddressRange::Explicit { first, last } => {
                let width = IpFamily::of(first).width();
                let (mut lo, hi) = (ip_to_u128(*first), ip_to_u128(*last));
                let mut min = width;
                loop {
                    let span = hi - lo;
                    // Largest block aligned at `lo` that fits in what remains.
                    let align = lo.trailing_zeros().min(u32::from(width));
                    let fit = if span == u128::MAX { 128 } else { 127 - (span + 1).leading_zeros() };
                    let bits = align.min(fit);
                    let prefix = width - u8::try_from(bits).unwrap_or(width);
                    min = min.min(prefix);
                    if bits >= 128 {
                        break;
                    }
                    match lo.checked_add(1u128 << bits) {
                        Some(next) if next <= hi => lo = next,
                        _ => break,
                    }
                }
                min
            }
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressRange::Cidr(net) => write!(f, "{net}"),
            AddressRange::Explicit { first, last } => write!(f, "{first}-{last}"),
        }
    }
}

/// A BGP community value (RFC 1997), `high:low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Community(pub u32);

impl Community {
    /// `NO_EXPORT`
    pub const NO_EXPORT: Community = Community(0xFFFF_FF01);
    /// `NO_ADVERTISE`
    pub const NO_ADVERTISE: Community = Community(0xFFFF_FF02);
    /// `NO_EXPORT_SUBCONFED`
    pub const NO_EXPORT_SUBCONFED: Community = Community(0xFFFF_FF03);
    /// `NOPEER` (RFC 3765)
    pub const NO_PEER: Community = Community(0xFFFF_FF04);
}

impl FromStr for Community {
    type Err = CommunityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "no-export" => return Ok(Community::NO_EXPORT),
            "no-advertise" => return Ok(Community::NO_ADVERTISE),
            "no-export-subconfed" => return Ok(Community::NO_EXPORT_SUBCONFED),
            "no-peer" => return Ok(Community::NO_PEER),
            _ => {}
        }
        let (high, low) = s.trim().split_once(':').ok_or(CommunityError::MissingSeparator)?;
        let high: u16 = high.parse()?;
        let low: u16 = low.parse()?;
        Ok(Community((u32::from(high) << 16) | u32::from(low)))
    }
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 16, self.0 & 0xFFFF)
    }
}

/// How allocated addresses of a BGP pool are advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpAdvertisement {
    /// Prefix length used when advertising IPv4 addresses
    pub aggregation_length_v4: u8,
    /// Prefix length used when advertising IPv6 addresses
    pub aggregation_length_v6: u8,
    /// LOCAL_PREF for iBGP sessions
    pub local_pref: Option<u32>,
    /// Communities attached to the route, sorted and deduplicated
    pub communities: Vec<Community>,
    /// Peer names the route is limited to; empty means every peer
    pub peers: Vec<String>,
}

impl Default for BgpAdvertisement {
    fn default() -> Self {
        Self {
            aggregation_length_v4: 32,
            aggregation_length_v6: 128,
            local_pref: None,
            communities: Vec::new(),
            peers: Vec::new(),
        }
    }
}

impl BgpAdvertisement {
    /// Aggregation length for the family of `ip`.
    #[must_use]
    pub fn aggregation_length(&self, ip: &IpAddr) -> u8 {
        match IpFamily::of(ip) {
            IpFamily::V4 => self.aggregation_length_v4,
            IpFamily::V6 => self.aggregation_length_v6,
        }
    }

    /// The prefix advertised for an allocated address.
    #[must_use]
    pub fn prefix_for(&self, ip: IpAddr) -> IpNet {
        // Lengths are validated against the family width at parse time.
        IpNet::new(ip, self.aggregation_length(&ip))
            .unwrap_or_else(|_| IpNet::from(ip))
            .trunc()
    }
}

/// Raw advertisement settings, as written by the administrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BgpAdvertisementConfig {
    /// IPv4 aggregation length (default 32)
    #[serde(default)]
    pub aggregation_length: Option<u8>,
    /// IPv6 aggregation length (default 128)
    #[serde(default, rename = "aggregationLengthV6")]
    pub aggregation_length_v6: Option<u8>,
    /// LOCAL_PREF for iBGP sessions
    #[serde(default)]
    pub local_pref: Option<u32>,
    /// Communities as `high:low` or well-known names
    #[serde(default)]
    pub communities: Vec<String>,
    /// Peer names to limit the advertisement to
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Raw pool settings, as written by the administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Unique pool name
    pub name: String,
    /// Announcement protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// CIDRs and `first-last` ranges, in scan order
    pub addresses: Vec<String>,
    /// Whether the pool is eligible for automatic allocation
    #[serde(default = "default_true")]
    pub auto_assign: bool,
    /// Skip IPv4 addresses ending in `.0` or `.255`
    #[serde(default, rename = "avoidBuggyIPs")]
    pub avoid_buggy_ips: bool,
    /// Advertisement settings, BGP pools only
    #[serde(default)]
    pub bgp_advertisements: Vec<BgpAdvertisementConfig>,
}

impl PoolConfig {
    /// A layer2 pool with the given ranges and default flags.
    pub fn new(name: impl Into<String>, addresses: &[&str]) -> Self {
        Self {
            name: name.into(),
            protocol: Protocol::Layer2,
            addresses: addresses.iter().map(ToString::to_string).collect(),
            auto_assign: true,
            avoid_buggy_ips: false,
            bgp_advertisements: Vec::new(),
        }
    }
}

/// A validated address pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    /// Unique pool name
    pub name: String,
    /// Announcement protocol
    pub protocol: Protocol,
    /// Ranges in declaration order
    pub ranges: Vec<AddressRange>,
    /// Whether the pool is eligible for automatic allocation
    pub auto_assign: bool,
    /// Skip IPv4 addresses ending in `.0` or `.255`
    pub avoid_buggy_ips: bool,
    /// Advertisements for BGP pools; empty for layer2 pools
    pub bgp_advertisements: Vec<BgpAdvertisement>,
}

/// Parses one pool. Does not check for conflicts with other pools, see [`validate`].
pub fn parse_pool(config: &PoolConfig) -> Result<Pool, PoolError> {
    let name = config.name.trim();
    if name.is_empty() {
        return Err(PoolError::MissingPoolName);
    }
    if config.addresses.is_empty() {
        return Err(PoolError::NoAddresses(name.to_string()));
    }

    let ranges = config
        .addresses
        .iter()
        .map(|text| AddressRange::parse(name, text))
        .collect::<Result<Vec<_>, _>>()?;

    let bgp_advertisements = match config.protocol {
        Protocol::Layer2 => {
            if !config.bgp_advertisements.is_empty() {
                return Err(PoolError::InvalidAdvertisement {
                    pool: name.to_string(),
                    reason: "layer2 pools cannot have bgp advertisements".to_string(),
                });
            }
            Vec::new()
        }
        Protocol::Bgp if config.bgp_advertisements.is_empty() => vec![BgpAdvertisement::default()],
        Protocol::Bgp => config
            .bgp_advertisements
            .iter()
            .map(|adv| parse_advertisement(name, adv, &ranges))
            .collect::<Result<Vec<_>, _>>()?,
    };

    Ok(Pool {
        name: name.to_string(),
        protocol: config.protocol,
        ranges,
        auto_assign: config.auto_assign,
        avoid_buggy_ips: config.avoid_buggy_ips,
        bgp_advertisements,
    })
}

fn parse_advertisement(
    pool: &str,
    config: &BgpAdvertisementConfig,
    ranges: &[AddressRange],
) -> Result<BgpAdvertisement, PoolError> {
    let invalid = |reason: String| PoolError::InvalidAdvertisement {
        pool: pool.to_string(),
        reason,
    };

    let v4 = config.aggregation_length.unwrap_or(32);
    let v6 = config.aggregation_length_v6.unwrap_or(128);
    for (family, length) in [(IpFamily::V4, v4), (IpFamily::V6, v6)] {
        if length > family.width() {
            return Err(invalid(format!(
                "{family} aggregation length {length} exceeds {}",
                family.width()
            )));
        }
        // A shorter aggregation than a range's own prefix would announce
        // addresses outside the pool.
        if let Some(range) = ranges
            .iter()
            .filter(|r| r.family() == family)
            .find(|r| length < r.min_prefix_len())
        {
            return Err(invalid(format!(
                "{family} aggregation length {length} is shorter than range {range}"
            )));
        }
    }

    let mut communities = config
        .communities
        .iter()
        .map(|text| {
            text.parse::<Community>().map_err(|source| PoolError::InvalidCommunity {
                pool: pool.to_string(),
                community: text.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    communities.sort_unstable();
    communities.dedup();

    Ok(BgpAdvertisement {
        aggregation_length_v4: v4,
        aggregation_length_v6: v6,
        local_pref: config.local_pref,
        communities,
        peers: config.peers.clone(),
    })
}

impl Pool {
    /// Number of usable addresses per family, `(v4, v6)`, saturating at `u64::MAX`.
    #[must_use]
    pub fn size(&self) -> (u64, u64) {
        let mut v4: u64 = 0;
        let mut v6: u64 = 0;
        for range in &self.ranges {
            let (lo, hi) = range.usable_bounds();
            if lo > hi {
                continue;
            }
            let mut count = (hi - lo).saturating_add(1);
            if self.avoid_buggy_ips && range.family() == IpFamily::V4 {
                count -= count_with_low_octet(lo, hi, 0) + count_with_low_octet(lo, hi, 255);
            }
            let count = u64::try_from(count).unwrap_or(u64::MAX);
            match range.family() {
                IpFamily::V4 => v4 = v4.saturating_add(count),
                IpFamily::V6 => v6 = v6.saturating_add(count),
            }
        }
        (v4, v6)
    }

    /// Whether `ip` is an address this pool may hand out.
    #[must_use]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        if self.avoid_buggy_ips && is_buggy(ip) {
            return false;
        }
        let value = ip_to_u128(*ip);
        let family = IpFamily::of(ip);
        self.ranges.iter().filter(|r| r.family() == family).any(|r| {
            let (lo, hi) = r.usable_bounds();
            lo <= value && value <= hi
        })
    }

    /// Whether the pool has any range of the given family.
    #[must_use]
    pub fn serves(&self, family: IpFamily) -> bool {
        self.ranges.iter().any(|r| r.family() == family)
    }

    /// Usable addresses of one family, in scan order.
    ///
    /// Lazy: IPv6 ranges can be astronomically large.
    pub fn addresses(&self, family: IpFamily) -> impl Iterator<Item = IpAddr> + '_ {
        self.ranges
            .iter()
            .filter(move |r| r.family() == family)
            .flat_map(move |r| {
                let (lo, hi) = r.usable_bounds();
                // Inclusive; empty when `lo > hi`.
                let mut next = (lo <= hi).then_some(lo);
                std::iter::from_fn(move || {
                    let current = next?;
                    next = if current < hi { Some(current + 1) } else { None };
                    Some(u128_to_ip(current, family))
                })
            })
            .filter(move |ip| !(self.avoid_buggy_ips && is_buggy(ip)))
    }
}

/// Rejects pool sets with duplicate names or overlapping ranges.
///
/// Names are checked first. Ranges are compared on their full bounds,
/// network address included.
pub fn validate(pools: &[Pool]) -> Result<(), PoolError> {
    let mut names = std::collections::HashSet::new();
    for pool in pools {
        if !names.insert(pool.name.as_str()) {
            return Err(PoolError::DuplicatePoolName(pool.name.clone()));
        }
    }

    for family in [IpFamily::V4, IpFamily::V6] {
        let mut spans: Vec<(u128, u128, &Pool, &AddressRange)> = pools
            .iter()
            .flat_map(|pool| pool.ranges.iter().map(move |range| (pool, range)))
            .filter(|(_, range)| range.family() == family)
            .map(|(pool, range)| {
                let (first, last) = range.bounds();
                (ip_to_u128(first), ip_to_u128(last), pool, range)
            })
            .collect();
        spans.sort_by_key(|span| (span.0, span.1));

        let mut reach: Option<(u128, &Pool)> = None;
        for (lo, hi, pool, range) in spans {
            if let Some((max_hi, owner)) = reach {
                if lo <= max_hi {
                    return Err(PoolError::OverlappingRanges {
                        first_pool: owner.name.clone(),
                        second_pool: pool.name.clone(),
                        range: range.to_string(),
                    });
                }
            }
            if reach.is_none_or(|(max_hi, _)| hi > max_hi) {
                reach = Some((hi, pool));
            }
        }
    }
    Ok(())
}

/// A validated, ordered set of pools.
///
/// Declaration order is the allocator's tie-break order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pools {
    pools: Vec<Pool>,
}

impl Pools {
    /// Validates and wraps a pool list.
    pub fn new(pools: Vec<Pool>) -> Result<Self, PoolError> {
        validate(&pools)?;
        Ok(Self { pools })
    }

    /// Parses and validates raw configuration. Fails on the first error.
    pub fn from_configs(configs: &[PoolConfig]) -> Result<Self, PoolError> {
        let pools = configs.iter().map(parse_pool).collect::<Result<Vec<_>, _>>()?;
        Self::new(pools)
    }

    /// Pool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Pool that may hand out `ip`, if any.
    #[must_use]
    pub fn pool_for(&self, ip: &IpAddr) -> Option<&Pool> {
        self.pools.iter().find(|p| p.contains(ip))
    }

    /// Pools in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Pool> {
        self.pools.iter()
    }

    /// Number of pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pool is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl<'a> IntoIterator for &'a Pools {
    type Item = &'a Pool;
    type IntoIter = std::slice::Iter<'a, Pool>;

    fn into_iter(self) -> Self::IntoIter {
        self.pools.iter()
    }
}

/// IPv4 addresses some consumer firmware refuses to use.
fn is_buggy(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => matches!(v4.octets()[3], 0 | 255),
        IpAddr::V6(_) => false,
    }
}

/// How many values in `[lo, hi]` have the given low octet.
fn count_with_low_octet(lo: u128, hi: u128, octet: u128) -> u128 {
    let up_to = |n: u128| if n < octet { 0 } else { (n - octet) / 256 + 1 };
    up_to(hi) - if lo == 0 { 0 } else { up_to(lo - 1) }
}

pub(crate) fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(value: u128, family: IpFamily) -> IpAddr {
    match family {
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::from(u32::try_from(value).unwrap_or(u32::MAX))),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}
