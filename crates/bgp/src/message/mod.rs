//! # BGP-4 messages
//!
//! Bit-exact encoding and decoding of the four RFC 4271 message types.
//!
//! Every message starts with a 19-byte header: a 16-byte all-ones marker,
//! the total length (header included, 19..=4096) and the type. All integers
//! are big-endian.

pub mod notification;
pub mod open;
pub mod prefix;
pub mod update;

use crate::error::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

pub use notification::Notification;
pub use open::{AddressFamily, Capability, Open};
pub use update::{AsSegment, AsSegmentType, MpReach, MpUnreach, Origin, PathAttribute, Update};

/// Header marker
pub const MARKER: [u8; 16] = [0xFF; 16];
/// Header length
pub const HEADER_LEN: usize = 19;
/// Largest message allowed on the wire
pub const MAX_MESSAGE_LEN: usize = 4096;
/// The only version spoken
pub const BGP_VERSION: u8 = 4;
/// Placeholder 2-octet AS for 4-octet ASNs (RFC 6793)
pub const AS_TRANS: u16 = 23456;

const TYPE_OPEN: u8 = 1;
const TYPE_UPDATE: u8 = 2;
const TYPE_NOTIFICATION: u8 = 3;
const TYPE_KEEPALIVE: u8 = 4;

/// A BGP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// OPEN
    Open(Open),
    /// UPDATE
    Update(Update),
    /// NOTIFICATION
    Notification(Notification),
    /// KEEPALIVE
    Keepalive,
}

impl Message {
    /// Short name for logs and FSM errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Message::Open(_) => "OPEN",
            Message::Update(_) => "UPDATE",
            Message::Notification(_) => "NOTIFICATION",
            Message::Keepalive => "KEEPALIVE",
        }
    }

    fn type_code(&self) -> u8 {
        match self {
            Message::Open(_) => TYPE_OPEN,
            Message::Update(_) => TYPE_UPDATE,
            Message::Notification(_) => TYPE_NOTIFICATION,
            Message::Keepalive => TYPE_KEEPALIVE,
        }
    }

    /// Appends the encoded message to `dst`.
    ///
    /// `four_octet_as` selects the AS_PATH encoding negotiated for the session.
    /// On error `dst` is left as it was.
    pub fn encode(&self, four_octet_as: bool, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let start = dst.len();
        dst.put_slice(&MARKER);
        dst.put_u16(0);
        dst.put_u8(self.type_code());

        let body = match self {
            Message::Open(open) => {
                open.encode_body(dst);
                Ok(())
            }
            Message::Update(update) => update.encode_body(four_octet_as, dst),
            Message::Notification(notification) => {
                notification.encode_body(dst);
                Ok(())
            }
            Message::Keepalive => Ok(()),
        };
        if let Err(e) = body {
            dst.truncate(start);
            return Err(e);
        }

        let len = dst.len() - start;
        if len > MAX_MESSAGE_LEN {
            dst.truncate(start);
            return Err(EncodeError::MessageTooLong(len));
        }
        let len = u16::try_from(len)?;
        dst[start + 16..start + 18].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Encodes into a fresh buffer.
    pub fn to_bytes(&self, four_octet_as: bool) -> Result<BytesMut, EncodeError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        self.encode(four_octet_as, &mut buf)?;
        Ok(buf)
    }

    /// Decodes exactly one message from `frame`.
    ///
    /// The header length must equal `frame.len()`; a shorter frame is
    /// [`DecodeError::TruncatedMessage`].
    pub fn decode(frame: &[u8], four_octet_as: bool) -> Result<Self, DecodeError> {
        let Some(header) = Header::parse(frame)? else {
            return Err(DecodeError::TruncatedMessage {
                declared: HEADER_LEN,
                available: frame.len(),
            });
        };
        if frame.len() != header.length {
            return Err(DecodeError::TruncatedMessage {
                declared: header.length,
                available: frame.len(),
            });
        }

        let body = &frame[HEADER_LEN..];
        let bad_length = || DecodeError::BadMessageLength(u16::try_from(header.length).unwrap_or(u16::MAX));
        match header.kind {
            TYPE_OPEN => {
                if body.len() < open::MIN_BODY_LEN {
                    return Err(bad_length());
                }
                Open::decode_body(body).map(Message::Open)
            }
            TYPE_UPDATE => {
                if body.len() < update::MIN_BODY_LEN {
                    return Err(bad_length());
                }
                Update::decode_body(body, four_octet_as).map(Message::Update)
            }
            TYPE_NOTIFICATION => Notification::decode_body(body).map(Message::Notification),
            TYPE_KEEPALIVE if body.is_empty() => Ok(Message::Keepalive),
            TYPE_KEEPALIVE => Err(bad_length()),
            other => Err(DecodeError::BadMessageType(other)),
        }
    }
}

/// A validated message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    /// Total message length, header included
    pub(crate) length: usize,
    /// Message type
    pub(crate) kind: u8,
}

impl Header {
    /// Parses the header at the start of `buf`; `None` if fewer than 19 bytes.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<Self>, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        if buf[..16] != MARKER {
            return Err(DecodeError::ConnectionNotSynchronized);
        }
        let length = u16::from_be_bytes([buf[16], buf[17]]);
        if usize::from(length) < HEADER_LEN || usize::from(length) > MAX_MESSAGE_LEN {
            return Err(DecodeError::BadMessageLength(length));
        }
        Ok(Some(Self {
            length: usize::from(length),
            kind: buf[18],
        }))
    }
}

/// Bounds-checked cursor over a message body.
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}
