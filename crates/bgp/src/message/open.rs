//! OPEN message (RFC 4271 §4.2) with capabilities (RFC 5492).

use super::{AS_TRANS, BGP_VERSION, Reader};
use crate::error::DecodeError;
use bytes::BufMut;
use std::net::Ipv4Addr;

/// Version, AS, hold time, identifier and parameter length.
pub(crate) const MIN_BODY_LEN: usize = 10;

const PARAM_CAPABILITIES: u8 = 2;
const CAP_MULTIPROTOCOL: u8 = 1;
const CAP_ROUTE_REFRESH: u8 = 2;
const CAP_FOUR_OCTET_AS: u8 = 65;

/// AFI/SAFI pairs this speaker knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    /// AFI 1, SAFI 1
    Ipv4Unicast,
    /// AFI 2, SAFI 1
    Ipv6Unicast,
}

impl AddressFamily {
    /// Address Family Identifier
    #[must_use]
    pub fn afi(self) -> u16 {
        match self {
            AddressFamily::Ipv4Unicast => 1,
            AddressFamily::Ipv6Unicast => 2,
        }
    }

    /// Subsequent Address Family Identifier
    #[must_use]
    pub fn safi(self) -> u8 {
        1
    }

    /// The known family for an AFI/SAFI pair.
    #[must_use]
    pub fn from_afi_safi(afi: u16, safi: u8) -> Option<Self> {
        match (afi, safi) {
            (1, 1) => Some(AddressFamily::Ipv4Unicast),
            (2, 1) => Some(AddressFamily::Ipv6Unicast),
            _ => None,
        }
    }
}

/// An OPEN capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Multiprotocol extensions (RFC 4760)
    Multiprotocol {
        /// Address Family Identifier
        afi: u16,
        /// Subsequent Address Family Identifier
        safi: u8,
    },
    /// Route refresh (RFC 2918)
    RouteRefresh,
    /// 4-octet AS numbers (RFC 6793), carrying the real ASN
    FourOctetAs(u32),
    /// Anything else, kept opaque
    Unknown {
        /// Capability code
        code: u8,
        /// Capability value
        value: Vec<u8>,
    },
}

impl Capability {
    fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Capability::Multiprotocol { afi, safi } => {
                dst.put_u8(CAP_MULTIPROTOCOL);
                dst.put_u8(4);
                dst.put_u16(*afi);
                dst.put_u8(0);
                dst.put_u8(*safi);
            }
            Capability::RouteRefresh => {
                dst.put_u8(CAP_ROUTE_REFRESH);
                dst.put_u8(0);
            }
            Capability::FourOctetAs(asn) => {
                dst.put_u8(CAP_FOUR_OCTET_AS);
                dst.put_u8(4);
                dst.put_u32(*asn);
            }
            Capability::Unknown { code, value } => {
                dst.put_u8(*code);
                dst.put_u8(u8::try_from(value.len()).unwrap_or(u8::MAX));
                dst.put_slice(&value[..value.len().min(255)]);
            }
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Capability::Multiprotocol { .. } | Capability::FourOctetAs(_) => 6,
            Capability::RouteRefresh => 2,
            Capability::Unknown { value, .. } => 2 + value.len().min(255),
        }
    }

    fn decode_all(buf: &[u8]) -> Result<Vec<Self>, DecodeError> {
        let malformed = || DecodeError::MalformedOpen("truncated capability".to_string());
        let mut reader = Reader::new(buf);
        let mut out = Vec::new();
        while !reader.is_empty() {
            let code = reader.u8().ok_or_else(malformed)?;
            let len = reader.u8().ok_or_else(malformed)?;
            let value = reader.take(usize::from(len)).ok_or_else(malformed)?;
            let capability = match (code, value) {
                (CAP_MULTIPROTOCOL, [a, b, _, safi]) => Capability::Multiprotocol {
                    afi: u16::from_be_bytes([*a, *b]),
                    safi: *safi,
                },
                (CAP_FOUR_OCTET_AS, [a, b, c, d]) => {
                    Capability::FourOctetAs(u32::from_be_bytes([*a, *b, *c, *d]))
                }
                (CAP_ROUTE_REFRESH, []) => Capability::RouteRefresh,
                (CAP_MULTIPROTOCOL | CAP_FOUR_OCTET_AS | CAP_ROUTE_REFRESH, _) => {
                    return Err(DecodeError::MalformedOpen(format!(
                        "capability {code} has length {len}"
                    )));
                }
                _ => Capability::Unknown { code, value: value.to_vec() },
            };
            out.push(capability);
        }
        Ok(out)
    }
}

/// An OPEN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
    /// 2-octet AS field; [`AS_TRANS`] when the real ASN needs 4 octets
    pub my_as: u16,
    /// Proposed hold time in seconds
    pub hold_time: u16,
    /// BGP identifier
    pub router_id: Ipv4Addr,
    /// Capabilities, in the order they were sent
    pub capabilities: Vec<Capability>,
}

impl Open {
    /// Builds the OPEN this speaker sends.
    ///
    /// Always announces 4-octet AS support and one multiprotocol capability
    /// per family.
    #[must_use]
    pub fn new(asn: u32, hold_time: u16, router_id: Ipv4Addr, families: &[AddressFamily]) -> Self {
        let mut capabilities: Vec<Capability> = families
            .iter()
            .map(|f| Capability::Multiprotocol { afi: f.afi(), safi: f.safi() })
            .collect();
        capabilities.push(Capability::FourOctetAs(asn));
        Self {
            my_as: u16::try_from(asn).unwrap_or(AS_TRANS),
            hold_time,
            router_id,
            capabilities,
        }
    }

    /// The sender's ASN, taken from the 4-octet capability when present.
    #[must_use]
    pub fn asn(&self) -> u32 {
        self.capabilities
            .iter()
            .find_map(|c| match c {
                Capability::FourOctetAs(asn) => Some(*asn),
                _ => None,
            })
            .unwrap_or(u32::from(self.my_as))
    }

    /// Whether the sender announced 4-octet AS support.
    #[must_use]
    pub fn supports_four_octet_as(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| matches!(c, Capability::FourOctetAs(_)))
    }

    /// Whether the sender can carry `family`.
    ///
    /// A speaker announcing no multiprotocol capability at all only speaks
    /// IPv4 unicast.
    #[must_use]
    pub fn supports_family(&self, family: AddressFamily) -> bool {
        let mut announced = self
            .capabilities
            .iter()
            .filter_map(|c| match c {
                Capability::Multiprotocol { afi, safi } => Some((*afi, *safi)),
                _ => None,
            })
            .peekable();
        if announced.peek().is_none() {
            return family == AddressFamily::Ipv4Unicast;
        }
        announced.any(|(afi, safi)| AddressFamily::from_afi_safi(afi, safi) == Some(family))
    }

    pub(crate) fn encode_body(&self, dst: &mut impl BufMut) {
        dst.put_u8(BGP_VERSION);
        dst.put_u16(self.my_as);
        dst.put_u16(self.hold_time);
        dst.put_slice(&self.router_id.octets());

        if self.capabilities.is_empty() {
            dst.put_u8(0);
            return;
        }
        // One capabilities parameter; a parameter carries at most 255 bytes.
        let mut caps_len = 0usize;
        let fitting: Vec<&Capability> = self
            .capabilities
            .iter()
            .take_while(|c| {
                caps_len += c.encoded_len();
                caps_len <= 253
            })
            .collect();
        let caps_len: usize = fitting.iter().map(|c| c.encoded_len()).sum();
        let caps_len = u8::try_from(caps_len).unwrap_or(u8::MAX);
        dst.put_u8(caps_len.saturating_add(2));
        dst.put_u8(PARAM_CAPABILITIES);
        dst.put_u8(caps_len);
        for capability in fitting {
            capability.encode(dst);
        }
    }

    pub(crate) fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
        let malformed = |what: &str| DecodeError::MalformedOpen(what.to_string());
        let mut reader = Reader::new(body);
        let version = reader.u8().ok_or_else(|| malformed("missing version"))?;
        if version != BGP_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let my_as = reader.u16().ok_or_else(|| malformed("missing AS"))?;
        let hold_time = reader.u16().ok_or_else(|| malformed("missing hold time"))?;
        let router_id = Ipv4Addr::from(reader.u32().ok_or_else(|| malformed("missing identifier"))?);
        let params_len = reader.u8().ok_or_else(|| malformed("missing parameter length"))?;
        if reader.remaining() != usize::from(params_len) {
            return Err(malformed("optional parameter length mismatch"));
        }

        let mut capabilities = Vec::new();
        while !reader.is_empty() {
            let kind = reader.u8().ok_or_else(|| malformed("truncated parameter"))?;
            let len = reader.u8().ok_or_else(|| malformed("truncated parameter"))?;
            let value = reader
                .take(usize::from(len))
                .ok_or_else(|| malformed("truncated parameter"))?;
            if kind != PARAM_CAPABILITIES {
                return Err(DecodeError::UnsupportedOptionalParameter(kind));
            }
            capabilities.extend(Capability::decode_all(value)?);
        }

        Ok(Self { my_as, hold_time, router_id, capabilities })
    }
}
