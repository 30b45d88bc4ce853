//! LoadBalancer CRD Definitions
//!
//! Custom resources declaring address pools, BGP advertisements and BGP
//! peers, and their conversion into the core `ipam` and `bgp` configuration
//! values.

pub mod bgp_advertisement;
pub mod bgp_peer;
pub mod convert;
pub mod error;
pub mod ip_address_pool;

pub use bgp_advertisement::*;
pub use bgp_peer::*;
pub use convert::{peer_config, peer_configs, pool_configs};
pub use error::ConversionError;
pub use ip_address_pool::*;
