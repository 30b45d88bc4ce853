//! Errors raised while turning resources into core configuration.

use thiserror::Error;

/// A resource that cannot be turned into pool or peer configuration.
///
/// Like a pool validation error, any of these rejects the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// Resource without `metadata.name`
    #[error("{0} without a name")]
    MissingName(&'static str),

    /// Advertisement naming a pool that is not declared
    #[error("BGPAdvertisement {advertisement} references unknown pool {pool}")]
    UnknownPool {
        /// Advertisement name
        advertisement: String,
        /// Pool it references
        pool: String,
    },

    /// Unparsable or unusable address field
    #[error("BGPPeer {peer}: invalid {field} {value:?}: {reason}")]
    InvalidAddress {
        /// Peer name
        peer: String,
        /// Field holding the address
        field: &'static str,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// AS number 0
    #[error("BGPPeer {0}: AS numbers must not be 0")]
    InvalidAsn(String),

    /// Hold time that cannot be proposed in an OPEN
    #[error("BGPPeer {peer}: invalid hold time {value:?}: {reason}")]
    InvalidHoldTime {
        /// Peer name
        peer: String,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}
