//! Configured BGP neighbors.

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Standard BGP port.
pub const DEFAULT_PORT: u16 = 179;
/// Hold time proposed when none is configured.
pub const DEFAULT_HOLD_TIME: Duration = Duration::from_secs(90);

/// A BGP neighbor to advertise routes to.
///
/// Every field takes part in the OPEN exchange or the connection itself, so
/// a changed peer gets a new session rather than an update in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    /// Unique name, used as the session key
    pub name: String,
    /// Local AS number
    pub local_asn: u32,
    /// Peer AS number
    pub peer_asn: u32,
    /// Peer address
    pub address: IpAddr,
    /// Peer TCP port
    pub port: u16,
    /// Local address to connect from
    pub source_address: Option<IpAddr>,
    /// Proposed hold time
    pub hold_time: Duration,
    /// BGP identifier; derived from the connection when absent
    pub router_id: Option<Ipv4Addr>,
    /// TCP MD5 signature key
    pub password: Option<String>,
    /// Label selectors; the peer applies to nodes matching any of them
    pub node_selectors: Vec<BTreeMap<String, String>>,
}

impl PeerConfig {
    /// A peer with default port, hold time and no optional settings.
    #[must_use]
    pub fn new(name: impl Into<String>, local_asn: u32, peer_asn: u32, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            local_asn,
            peer_asn,
            address,
            port: DEFAULT_PORT,
            source_address: None,
            hold_time: DEFAULT_HOLD_TIME,
            router_id: None,
            password: None,
            node_selectors: Vec::new(),
        }
    }

    /// Copy safe to log or serve; the password is replaced.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            password: self.password.as_ref().map(|_| "REDACTED".to_string()),
            ..self.clone()
        }
    }

    /// Whether this peer applies to a node with `labels`.
    ///
    /// No selectors means every node.
    #[must_use]
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.node_selectors.is_empty()
            || self
                .node_selectors
                .iter()
                .any(|selector| selector.iter().all(|(k, v)| labels.get(k) == Some(v)))
    }

    /// Internal BGP session.
    #[must_use]
    pub fn is_ibgp(&self) -> bool {
        self.local_asn == self.peer_asn
    }

    /// Hold time in whole seconds as carried in OPEN.
    #[must_use]
    pub fn hold_time_secs(&self) -> u16 {
        u16::try_from(self.hold_time.as_secs()).unwrap_or(u16::MAX)
    }

    /// `address:port`, for logs.
    #[must_use]
    pub fn endpoint(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.address, self.port)
    }
}
