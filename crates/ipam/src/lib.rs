//! LoadBalancer IPAM
//!
//! Address pool model and the deterministic allocator that hands pool
//! addresses to LoadBalancer services.

pub mod allocator;
pub mod error;
pub mod pool;

#[cfg(test)]
mod allocator_test;

pub use allocator::*;
pub use error::*;
pub use pool::*;
