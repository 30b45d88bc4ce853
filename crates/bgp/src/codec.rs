//! Stream framing for BGP messages on a TCP connection.

use crate::error::{CodecError, DecodeError};
use crate::message::{Header, Message};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Frames BGP messages for [`tokio_util::codec::Framed`].
///
/// AS numbers in AS_PATH are 2 octets until both sides have advertised the
/// 4-octet AS capability; the session flips the flag once the OPENs agree.
#[derive(Debug, Clone, Copy, Default)]
pub struct BgpCodec {
    four_octet_as: bool,
}

impl BgpCodec {
    /// Codec using 2-octet AS_PATH encoding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the negotiated AS_PATH encoding.
    pub fn set_four_octet_as(&mut self, enabled: bool) {
        self.four_octet_as = enabled;
    }
}

impl Decoder for BgpCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let Some(header) = Header::parse(src)? else {
            return Ok(None);
        };
        if src.len() < header.length {
            src.reserve(header.length - src.len());
            return Ok(None);
        }
        let frame = src.split_to(header.length);
        Ok(Some(Message::decode(&frame, self.four_octet_as)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // The peer closed mid-message.
        let declared = Header::parse(src)?.map_or(crate::message::HEADER_LEN, |h| h.length);
        let available = src.len();
        src.clear();
        Err(DecodeError::TruncatedMessage { declared, available }.into())
    }
}

impl Encoder<Message> for BgpCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        item.encode(self.four_octet_as, dst)?;
        Ok(())
    }
}
