//! IPAddressPool CRD
//!
//! Declares a set of addresses the controller may hand out to LoadBalancer
//! services.

use ipam::PoolStats;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "metallb.io",
    version = "v1beta1",
    kind = "IPAddressPool",
    namespaced,
    status = "IPAddressPoolStatus"
)]
#[kube(
    printcolumn = r#"{"name":"AUTO ASSIGN", "type":"boolean", "jsonPath":".spec.autoAssign"}"#,
    printcolumn = r#"{"name":"AVOID BUGGY IPS", "type":"boolean", "jsonPath":".spec.avoidBuggyIPs"}"#,
    printcolumn = r#"{"name":"ADDRESSES", "type":"string", "jsonPath":".spec.addresses"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressPoolSpec {
    /// CIDRs (`192.168.10.0/24`) or inclusive ranges
    /// (`192.168.9.1-192.168.9.5`), scanned in the order given
    pub addresses: Vec<String>,

    /// Whether services without an explicit pool or address may be given
    /// addresses from this pool
    #[serde(default = "default_true")]
    pub auto_assign: bool,

    /// Never hand out IPv4 addresses ending in `.0` or `.255`
    #[serde(default, rename = "avoidBuggyIPs")]
    pub avoid_buggy_ips: bool,
}

/// Observed usage of a pool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressPoolStatus {
    /// IPv4 addresses handed out
    #[serde(rename = "assignedIPv4")]
    pub assigned_ipv4: u64,

    /// IPv6 addresses handed out
    #[serde(rename = "assignedIPv6")]
    pub assigned_ipv6: u64,

    /// IPv4 addresses still free
    #[serde(rename = "availableIPv4")]
    pub available_ipv4: u64,

    /// IPv6 addresses still free
    #[serde(rename = "availableIPv6")]
    pub available_ipv6: u64,
}

impl From<&PoolStats> for IPAddressPoolStatus {
    fn from(stats: &PoolStats) -> Self {
        Self {
            assigned_ipv4: stats.in_use_v4,
            assigned_ipv6: stats.in_use_v6,
            available_ipv4: stats.capacity_v4.saturating_sub(stats.in_use_v4),
            available_ipv6: stats.capacity_v6.saturating_sub(stats.in_use_v6),
        }
    }
}
