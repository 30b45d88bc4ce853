//! Error types for the BGP wire codec.
//!
//! Every [`DecodeError`] maps to the NOTIFICATION that must be sent to the
//! peer before the session drops to `Idle`.

use crate::message::notification::{
    FSM_ERROR, MESSAGE_HEADER_ERROR, Notification, OPEN_MESSAGE_ERROR, UPDATE_MESSAGE_ERROR,
};
use std::io;
use std::num::TryFromIntError;
use thiserror::Error;

/// A received message that cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Header marker is not all ones
    #[error("connection not synchronized: bad marker")]
    ConnectionNotSynchronized,

    /// Header length outside 19..=4096, or wrong for the message type
    #[error("bad message length {0}")]
    BadMessageLength(u16),

    /// Declared length does not match the bytes available
    #[error("truncated message: header declares {declared} bytes, {available} available")]
    TruncatedMessage {
        /// Length from the header
        declared: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Unknown message type
    #[error("bad message type {0}")]
    BadMessageType(u8),

    /// OPEN carries a version other than 4
    #[error("unsupported BGP version {0}")]
    UnsupportedVersion(u8),

    /// OPEN from an unexpected AS
    #[error("bad peer AS {0}")]
    BadPeerAs(u32),

    /// OPEN carries an invalid router id
    #[error("bad BGP identifier")]
    BadBgpIdentifier,

    /// OPEN carries an optional parameter other than capabilities
    #[error("unsupported optional parameter {0}")]
    UnsupportedOptionalParameter(u8),

    /// OPEN hold time of 1 or 2 seconds
    #[error("unacceptable hold time {0}")]
    UnacceptableHoldTime(u16),

    /// Peer lacks a capability the session requires
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// OPEN body does not parse
    #[error("malformed OPEN: {0}")]
    MalformedOpen(String),

    /// UPDATE lengths are inconsistent, or an attribute is repeated
    #[error("malformed attribute list: {0}")]
    MalformedAttributeList(String),

    /// Unknown attribute flagged as well-known
    #[error("unrecognized well-known attribute {0}")]
    UnrecognizedWellKnownAttribute(u8),

    /// UPDATE with NLRI lacks a mandatory attribute
    #[error("missing well-known attribute {0}")]
    MissingWellKnownAttribute(u8),

    /// Attribute flags conflict with its type
    #[error("attribute flags error on attribute {0}")]
    AttributeFlagsError(u8),

    /// Attribute length is wrong for its type
    #[error("attribute length error on attribute {0}")]
    AttributeLengthError(u8),

    /// ORIGIN value other than IGP, EGP or INCOMPLETE
    #[error("invalid ORIGIN {0}")]
    InvalidOrigin(u8),

    /// NEXT_HOP that cannot be used
    #[error("invalid NEXT_HOP")]
    InvalidNextHop,

    /// Optional attribute that does not parse
    #[error("optional attribute error on attribute {0}")]
    OptionalAttributeError(u8),

    /// Prefix with a bad length or host bits set
    #[error("invalid network field: {0}")]
    InvalidNetworkField(String),

    /// AS_PATH does not parse
    #[error("malformed AS_PATH")]
    MalformedAsPath,

    /// Message not allowed in the current state
    #[error("unexpected {message} in state {state}")]
    UnexpectedMessage {
        /// Received message kind
        message: &'static str,
        /// Session state when it arrived
        state: &'static str,
    },
}

impl DecodeError {
    /// The NOTIFICATION reporting this error to the peer.
    #[must_use]
    pub fn notification(&self) -> Notification {
        match self {
            DecodeError::ConnectionNotSynchronized => Notification::new(MESSAGE_HEADER_ERROR, 1),
            DecodeError::BadMessageLength(len) => {
                Notification::with_data(MESSAGE_HEADER_ERROR, 2, len.to_be_bytes().to_vec())
            }
            DecodeError::TruncatedMessage { declared, .. } => Notification::with_data(
                MESSAGE_HEADER_ERROR,
                2,
                u16::try_from(*declared).unwrap_or(u16::MAX).to_be_bytes().to_vec(),
            ),
            DecodeError::BadMessageType(kind) => {
                Notification::with_data(MESSAGE_HEADER_ERROR, 3, vec![*kind])
            }
            DecodeError::UnsupportedVersion(_) => {
                // Data is the highest supported version.
                Notification::with_data(OPEN_MESSAGE_ERROR, 1, 4u16.to_be_bytes().to_vec())
            }
            DecodeError::BadPeerAs(_) => Notification::new(OPEN_MESSAGE_ERROR, 2),
            DecodeError::BadBgpIdentifier => Notification::new(OPEN_MESSAGE_ERROR, 3),
            DecodeError::UnsupportedOptionalParameter(_) => Notification::new(OPEN_MESSAGE_ERROR, 4),
            DecodeError::UnacceptableHoldTime(_) => Notification::new(OPEN_MESSAGE_ERROR, 6),
            DecodeError::UnsupportedCapability(_) => Notification::new(OPEN_MESSAGE_ERROR, 7),
            DecodeError::MalformedOpen(_) => Notification::new(OPEN_MESSAGE_ERROR, 0),
            DecodeError::MalformedAttributeList(_) => Notification::new(UPDATE_MESSAGE_ERROR, 1),
            DecodeError::UnrecognizedWellKnownAttribute(code) => {
                Notification::with_data(UPDATE_MESSAGE_ERROR, 2, vec![*code])
            }
            DecodeError::MissingWellKnownAttribute(code) => {
                Notification::with_data(UPDATE_MESSAGE_ERROR, 3, vec![*code])
            }
            DecodeError::AttributeFlagsError(_) => Notification::new(UPDATE_MESSAGE_ERROR, 4),
            DecodeError::AttributeLengthError(_) => Notification::new(UPDATE_MESSAGE_ERROR, 5),
            DecodeError::InvalidOrigin(_) => Notification::new(UPDATE_MESSAGE_ERROR, 6),
            DecodeError::InvalidNextHop => Notification::new(UPDATE_MESSAGE_ERROR, 8),
            DecodeError::OptionalAttributeError(_) => Notification::new(UPDATE_MESSAGE_ERROR, 9),
            DecodeError::InvalidNetworkField(_) => Notification::new(UPDATE_MESSAGE_ERROR, 10),
            DecodeError::MalformedAsPath => Notification::new(UPDATE_MESSAGE_ERROR, 11),
            DecodeError::UnexpectedMessage { state, .. } => {
                // RFC 6608 subcodes: 1 OpenSent, 2 OpenConfirm, 3 Established.
                let subcode = match *state {
                    "OpenSent" => 1,
                    "OpenConfirm" => 2,
                    "Established" => 3,
                    _ => 0,
                };
                Notification::new(FSM_ERROR, subcode)
            }
        }
    }
}

/// A message that cannot be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Encoded message exceeds 4096 bytes
    #[error("message of {0} bytes exceeds the 4096 byte limit")]
    MessageTooLong(usize),

    /// Attribute value exceeds 65535 bytes
    #[error("attribute {code} is too long: {source}")]
    AttributeTooLong {
        /// Attribute type code
        code: u8,
        /// Length conversion failure
        source: TryFromIntError,
    },

    /// A length does not fit its 2-octet field
    #[error("length field overflow: {0}")]
    LengthOverflow(#[from] TryFromIntError),
}

/// Errors surfaced by [`crate::codec::BgpCodec`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer sent something invalid
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Local message could not be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_message_maps_to_bad_length() {
        let n = DecodeError::TruncatedMessage { declared: 100, available: 40 }.notification();
        assert_eq!((n.code, n.subcode), (MESSAGE_HEADER_ERROR, 2));
        assert_eq!(n.data, vec![0, 100]);
    }

    #[test]
    fn test_unsupported_version_reports_version_four() {
        let n = DecodeError::UnsupportedVersion(3).notification();
        assert_eq!((n.code, n.subcode), (OPEN_MESSAGE_ERROR, 1));
        assert_eq!(n.data, vec![0, 4]);
    }

    #[test]
    fn test_unexpected_message_is_fsm_error() {
        let n = DecodeError::UnexpectedMessage { message: "UPDATE", state: "OpenConfirm" }
            .notification();
        assert_eq!((n.code, n.subcode), (FSM_ERROR, 2));
    }
}
