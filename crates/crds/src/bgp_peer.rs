//! BGPPeer CRD
//!
//! A router the speakers open BGP sessions with.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "metallb.io",
    version = "v1beta2",
    kind = "BGPPeer",
    namespaced
)]
#[kube(
    printcolumn = r#"{"name":"ADDRESS", "type":"string", "jsonPath":".spec.peerAddress"}"#,
    printcolumn = r#"{"name":"ASN", "type":"integer", "jsonPath":".spec.peerASN"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BGPPeerSpec {
    /// Local AS number
    #[serde(rename = "myASN")]
    pub my_asn: u32,

    /// AS number the peer is expected to announce
    #[serde(rename = "peerASN")]
    pub peer_asn: u32,

    /// Peer address
    pub peer_address: String,

    /// Peer TCP port (default 179)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_port: Option<u16>,

    /// Local address to connect from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_address: Option<String>,

    /// Proposed hold time, e.g. `90s` or `3m` (default 90s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_time: Option<String>,

    /// BGP identifier to use instead of the derived one
    #[serde(default, rename = "routerID", skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,

    /// TCP MD5 signature key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Nodes that should peer with this router; empty means every node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_selectors: Vec<NodeSelector>,
}

/// Label equality selector for nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    /// Labels the node must carry
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}
