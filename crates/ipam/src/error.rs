//! Error types for pool parsing and address allocation.

use std::net::IpAddr;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors raised while parsing or validating pool configuration.
///
/// Any of these rejects the whole configuration snapshot; the previously
/// accepted pools stay in effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Pool declared without a name
    #[error("pool has no name")]
    MissingPoolName,

    /// Pool declared without any address range
    #[error("pool {0} has no addresses")]
    NoAddresses(String),

    /// Range string is neither a CIDR nor a `first-last` pair
    #[error("pool {pool}: invalid range {range:?}: {reason}")]
    InvalidRangeSyntax {
        /// Pool being parsed
        pool: String,
        /// Offending range text
        range: String,
        /// Why it was rejected
        reason: String,
    },

    /// Range endpoints are of different address families
    #[error("pool {pool}: range {range:?} mixes IPv4 and IPv6 endpoints")]
    FamilyMismatch {
        /// Pool being parsed
        pool: String,
        /// Offending range text
        range: String,
    },

    /// Range with `last < first`
    #[error("pool {pool}: range {range:?} ends before it starts")]
    ReversedRange {
        /// Pool being parsed
        pool: String,
        /// Offending range text
        range: String,
    },

    /// Two pools share a name
    #[error("duplicate pool name {0}")]
    DuplicatePoolName(String),

    /// Two ranges cover a common address
    #[error("range {range} of pool {second_pool} overlaps with pool {first_pool}")]
    OverlappingRanges {
        /// Pool that declared the earlier range
        first_pool: String,
        /// Pool that declared the overlapping range
        second_pool: String,
        /// The overlapping range, as declared in `second_pool`
        range: String,
    },

    /// Invalid BGP advertisement settings
    #[error("pool {pool}: invalid bgp advertisement: {reason}")]
    InvalidAdvertisement {
        /// Pool being parsed
        pool: String,
        /// Why it was rejected
        reason: String,
    },

    /// Community string that is neither `high:low` nor a well-known name
    #[error("pool {pool}: invalid community {community:?}: {source}")]
    InvalidCommunity {
        /// Pool being parsed
        pool: String,
        /// Offending community text
        community: String,
        /// Why it does not parse
        source: CommunityError,
    },
}

/// A community string that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommunityError {
    /// No `:` between the two halves
    #[error("expected high:low or a well-known name")]
    MissingSeparator,

    /// A half is not a 16-bit number
    #[error("invalid 16-bit half: {0}")]
    InvalidHalf(#[from] ParseIntError),
}

/// Errors returned by [`crate::Allocator::assign`].
///
/// An error never changes allocator state: a service that already held an
/// allocation keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// Requested pool does not exist
    #[error("unknown pool {0}")]
    UnknownPool(String),

    /// Requested pool has no free or shareable address left
    #[error("no available addresses in pool {0}")]
    PoolExhausted(String),

    /// No auto-assign pool can serve the requested families
    #[error("no auto-assign pool serves the requested address families")]
    NoEligiblePool,

    /// Every eligible auto-assign pool is exhausted
    #[error("no available addresses in any auto-assign pool")]
    AllPoolsExhausted,

    /// Requested address is not usable in any configured pool
    #[error("{0} is not allowed in any configured pool")]
    AddressNotInAnyPool(IpAddr),

    /// Requested address is not in the requested pool
    #[error("{ip} is not in pool {pool}")]
    AddressNotInRequestedPool {
        /// Requested address
        ip: IpAddr,
        /// Requested pool
        pool: String,
    },

    /// Requested address is held by a service it cannot be shared with
    #[error("{ip} is already in use by {owner}")]
    AddressInUse {
        /// Requested address
        ip: IpAddr,
        /// One of the services currently holding it
        owner: String,
    },

    /// More than one address per family was requested
    #[error("at most one address per family may be requested, got {0:?}")]
    TooManyAddresses(Vec<IpAddr>),

    /// Requested addresses do not match the requested families
    #[error("requested addresses {addresses:?} do not match families {families}")]
    FamilyMismatch {
        /// Requested addresses
        addresses: Vec<IpAddr>,
        /// Requested families
        families: String,
    },
}
