//! Controller-specific error types.
//!
//! Only [`ControllerError`] stops the process. Everything else is reported
//! through logs and the status endpoint while the controller keeps running.

use crds::ConversionError;
use ipam::PoolError;
use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::num::TryFromIntError;
use thiserror::Error;

/// Errors that terminate the LoadBalancer controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Status listener could not be bound
    #[error("Failed to bind status endpoint on {addr}: {source}")]
    StatusBind {
        /// Requested listen address
        addr: SocketAddr,
        /// Underlying error
        source: io::Error,
    },

    /// Status server failed while serving
    #[error("Status server error: {0}")]
    StatusServe(io::Error),

    /// A controller task exited or panicked
    #[error("Task failed: {0}")]
    Task(String),
}

/// Errors that reject a configuration snapshot.
///
/// The previously accepted pools and peers stay active.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Resource conversion failed
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Pool parsing or validation failed
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Errors reading the manifest into a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Manifest is not valid YAML
    #[error("invalid YAML in document {index}: {source}")]
    Yaml {
        /// Zero-based document index
        index: usize,
        /// Underlying error
        source: serde_yaml::Error,
    },

    /// Document without `kind`
    #[error("document {0} has no kind")]
    MissingKind(usize),

    /// Document that does not match its kind's schema
    #[error("document {index} is not a valid {kind}: {source}")]
    InvalidDocument {
        /// Zero-based document index
        index: usize,
        /// Declared kind
        kind: String,
        /// Underlying error
        source: serde_yaml::Error,
    },
}

/// A LoadBalancer service whose request cannot be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Service without a name
    #[error("service without a name")]
    MissingName,

    /// Both the annotation and `spec.loadBalancerIP` request addresses
    #[error("service can not have both {0} and spec.loadBalancerIP")]
    ConflictingAddressRequests(&'static str),

    /// Requested address does not parse
    #[error("invalid requested address {value:?}: {source}")]
    InvalidAddress {
        /// Text as written on the service
        value: String,
        /// Parse failure
        source: AddrParseError,
    },

    /// Port outside the 16-bit range
    #[error("invalid port {port}: {source}")]
    InvalidPort {
        /// Port as declared
        port: i32,
        /// Conversion failure
        source: TryFromIntError,
    },
}
