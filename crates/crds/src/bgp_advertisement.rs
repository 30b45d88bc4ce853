//! BGPAdvertisement CRD
//!
//! Says how addresses of one or more pools are announced over BGP. A pool
//! named by at least one advertisement is a BGP pool; every other pool is
//! announced on layer 2.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "metallb.io",
    version = "v1beta1",
    kind = "BGPAdvertisement",
    namespaced
)]
#[kube(
    printcolumn = r#"{"name":"IPADDRESSPOOLS", "type":"string", "jsonPath":".spec.ipAddressPools"}"#,
    printcolumn = r#"{"name":"PEERS", "type":"string", "jsonPath":".spec.peers"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BGPAdvertisementSpec {
    /// Prefix length used for IPv4 routes (default 32)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_length: Option<u8>,

    /// Prefix length used for IPv6 routes (default 128)
    #[serde(default, rename = "aggregationLengthV6", skip_serializing_if = "Option::is_none")]
    pub aggregation_length_v6: Option<u8>,

    /// LOCAL_PREF sent to iBGP peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_pref: Option<u32>,

    /// Communities, `high:low` or a well-known name such as `no-export`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub communities: Vec<String>,

    /// Pools this advertisement applies to; empty means every pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_address_pools: Vec<String>,

    /// Peers to announce to; empty means every peer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<String>,
}

impl BGPAdvertisementSpec {
    /// Whether this advertisement covers pool `name`.
    #[must_use]
    pub fn selects_pool(&self, name: &str) -> bool {
        self.ip_address_pools.is_empty() || self.ip_address_pools.iter().any(|p| p == name)
    }
}
