//! NOTIFICATION message (RFC 4271 §4.5).

use crate::error::DecodeError;
use bytes::BufMut;
use std::fmt;

/// Message Header Error
pub const MESSAGE_HEADER_ERROR: u8 = 1;
/// OPEN Message Error
pub const OPEN_MESSAGE_ERROR: u8 = 2;
/// UPDATE Message Error
pub const UPDATE_MESSAGE_ERROR: u8 = 3;
/// Hold Timer Expired
pub const HOLD_TIMER_EXPIRED: u8 = 4;
/// Finite State Machine Error
pub const FSM_ERROR: u8 = 5;
/// Cease
pub const CEASE: u8 = 6;

/// Cease subcode: Administrative Shutdown (RFC 4486)
pub const CEASE_ADMINISTRATIVE_SHUTDOWN: u8 = 2;
/// Cease subcode: Peer De-configured (RFC 4486)
pub const CEASE_PEER_DECONFIGURED: u8 = 3;

/// An error report; the sender closes the connection right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Error code
    pub code: u8,
    /// Error subcode
    pub subcode: u8,
    /// Diagnostic data
    pub data: Vec<u8>,
}

impl Notification {
    /// A notification without data.
    #[must_use]
    pub fn new(code: u8, subcode: u8) -> Self {
        Self { code, subcode, data: Vec::new() }
    }

    /// A notification with diagnostic data.
    #[must_use]
    pub fn with_data(code: u8, subcode: u8, data: Vec<u8>) -> Self {
        Self { code, subcode, data }
    }

    /// Cease with the given subcode.
    #[must_use]
    pub fn cease(subcode: u8) -> Self {
        Self::new(CEASE, subcode)
    }

    /// Hold Timer Expired.
    #[must_use]
    pub fn hold_timer_expired() -> Self {
        Self::new(HOLD_TIMER_EXPIRED, 0)
    }

    pub(crate) fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.code);
        dst.put_u8(self.subcode);
        dst.put_slice(&self.data);
    }

    pub(crate) fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
        match body {
            [code, subcode, data @ ..] => Ok(Self::with_data(*code, *subcode, data.to_vec())),
            _ => Err(DecodeError::BadMessageLength(
                u16::try_from(body.len() + super::HEADER_LEN).unwrap_or(u16::MAX),
            )),
        }
    }

    fn code_name(&self) -> &'static str {
        match self.code {
            MESSAGE_HEADER_ERROR => "Message Header Error",
            OPEN_MESSAGE_ERROR => "OPEN Message Error",
            UPDATE_MESSAGE_ERROR => "UPDATE Message Error",
            HOLD_TIMER_EXPIRED => "Hold Timer Expired",
            FSM_ERROR => "Finite State Machine Error",
            CEASE => "Cease",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}, subcode {})", self.code_name(), self.code, self.subcode)
    }
}
