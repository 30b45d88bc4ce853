//! UPDATE message (RFC 4271 §4.3) and the path attributes this speaker
//! understands, including the multiprotocol attributes of RFC 4760 and the
//! communities of RFC 1997.

use super::open::AddressFamily;
use super::prefix::{PrefixFamily, decode_prefixes, encode_prefix};
use super::{AS_TRANS, Reader};
use crate::error::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Withdrawn-routes length and total path attribute length.
pub(crate) const MIN_BODY_LEN: usize = 4;

/// ORIGIN
pub const ATTR_ORIGIN: u8 = 1;
/// AS_PATH
pub const ATTR_AS_PATH: u8 = 2;
/// NEXT_HOP
pub const ATTR_NEXT_HOP: u8 = 3;
/// MULTI_EXIT_DISC
pub const ATTR_MULTI_EXIT_DISC: u8 = 4;
/// LOCAL_PREF
pub const ATTR_LOCAL_PREF: u8 = 5;
/// ATOMIC_AGGREGATE
pub const ATTR_ATOMIC_AGGREGATE: u8 = 6;
/// COMMUNITIES
pub const ATTR_COMMUNITIES: u8 = 8;
/// MP_REACH_NLRI
pub const ATTR_MP_REACH_NLRI: u8 = 14;
/// MP_UNREACH_NLRI
pub const ATTR_MP_UNREACH_NLRI: u8 = 15;

const FLAG_OPTIONAL: u8 = 0x80;
const FLAG_TRANSITIVE: u8 = 0x40;
const FLAG_EXTENDED_LENGTH: u8 = 0x10;

/// ORIGIN values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Learned from an interior protocol
    Igp,
    /// Learned from EGP
    Egp,
    /// Learned some other way
    Incomplete,
}

/// AS_PATH segment kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsSegmentType {
    /// Unordered AS_SET
    Set,
    /// Ordered AS_SEQUENCE
    Sequence,
}

/// One AS_PATH segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsSegment {
    /// Segment kind
    pub kind: AsSegmentType,
    /// ASNs in the segment
    pub asns: Vec<u32>,
}

impl AsSegment {
    /// An AS_SEQUENCE.
    #[must_use]
    pub fn sequence(asns: Vec<u32>) -> Self {
        Self { kind: AsSegmentType::Sequence, asns }
    }
}

/// MP_REACH_NLRI for a known address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpReach {
    /// Address family of the NLRI
    pub family: AddressFamily,
    /// Global next hop, optionally followed by a link-local one
    pub next_hops: Vec<IpAddr>,
    /// Reachable prefixes
    pub nlri: Vec<IpNet>,
}

/// MP_UNREACH_NLRI for a known address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpUnreach {
    /// Address family of the withdrawn prefixes
    pub family: AddressFamily,
    /// Withdrawn prefixes
    pub withdrawn: Vec<IpNet>,
}

/// A path attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathAttribute {
    /// ORIGIN
    Origin(Origin),
    /// AS_PATH
    AsPath(Vec<AsSegment>),
    /// NEXT_HOP for IPv4 NLRI
    NextHop(Ipv4Addr),
    /// MULTI_EXIT_DISC
    MultiExitDisc(u32),
    /// LOCAL_PREF
    LocalPref(u32),
    /// ATOMIC_AGGREGATE
    AtomicAggregate,
    /// COMMUNITIES
    Communities(Vec<u32>),
    /// MP_REACH_NLRI
    MpReach(MpReach),
    /// MP_UNREACH_NLRI
    MpUnreach(MpUnreach),
    /// Any other attribute, kept opaque
    Unknown {
        /// Attribute flags as received
        flags: u8,
        /// Attribute type code
        code: u8,
        /// Attribute value
        value: Vec<u8>,
    },
}

impl PathAttribute {
    /// Attribute type code.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            PathAttribute::Origin(_) => ATTR_ORIGIN,
            PathAttribute::AsPath(_) => ATTR_AS_PATH,
            PathAttribute::NextHop(_) => ATTR_NEXT_HOP,
            PathAttribute::MultiExitDisc(_) => ATTR_MULTI_EXIT_DISC,
            PathAttribute::LocalPref(_) => ATTR_LOCAL_PREF,
            PathAttribute::AtomicAggregate => ATTR_ATOMIC_AGGREGATE,
            PathAttribute::Communities(_) => ATTR_COMMUNITIES,
            PathAttribute::MpReach(_) => ATTR_MP_REACH_NLRI,
            PathAttribute::MpUnreach(_) => ATTR_MP_UNREACH_NLRI,
            PathAttribute::Unknown { code, .. } => *code,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            PathAttribute::Unknown { flags, .. } => flags & !FLAG_EXTENDED_LENGTH,
            other => expected_flags(other.code()).unwrap_or(FLAG_OPTIONAL),
        }
    }

    fn encode_value(&self, four_octet_as: bool, dst: &mut BytesMut) {
        match self {
            PathAttribute::Origin(origin) => dst.put_u8(match origin {
                Origin::Igp => 0,
                Origin::Egp => 1,
                Origin::Incomplete => 2,
            }),
            PathAttribute::AsPath(segments) => {
                for segment in segments {
                    // A segment holds at most 255 ASNs.
                    for chunk in segment.asns.chunks(255) {
                        dst.put_u8(match segment.kind {
                            AsSegmentType::Set => 1,
                            AsSegmentType::Sequence => 2,
                        });
                        dst.put_u8(u8::try_from(chunk.len()).unwrap_or(u8::MAX));
                        for asn in chunk {
                            if four_octet_as {
                                dst.put_u32(*asn);
                            } else {
                                dst.put_u16(u16::try_from(*asn).unwrap_or(AS_TRANS));
                            }
                        }
                    }
                }
            }
            PathAttribute::NextHop(ip) => dst.put_slice(&ip.octets()),
            PathAttribute::MultiExitDisc(value) | PathAttribute::LocalPref(value) => dst.put_u32(*value),
            PathAttribute::AtomicAggregate => {}
            PathAttribute::Communities(values) => {
                for value in values {
                    dst.put_u32(*value);
                }
            }
            PathAttribute::MpReach(reach) => {
                dst.put_u16(reach.family.afi());
                dst.put_u8(reach.family.safi());
                let mut hops = BytesMut::new();
                for hop in &reach.next_hops {
                    match hop {
                        IpAddr::V4(v4) => hops.put_slice(&v4.octets()),
                        IpAddr::V6(v6) => hops.put_slice(&v6.octets()),
                    }
                }
                dst.put_u8(u8::try_from(hops.len()).unwrap_or(u8::MAX));
                dst.put_slice(&hops);
                dst.put_u8(0);
                for prefix in &reach.nlri {
                    encode_prefix(prefix, dst);
                }
            }
            PathAttribute::MpUnreach(unreach) => {
                dst.put_u16(unreach.family.afi());
                dst.put_u8(unreach.family.safi());
                for prefix in &unreach.withdrawn {
                    encode_prefix(prefix, dst);
                }
            }
            PathAttribute::Unknown { value, .. } => dst.put_slice(value),
        }
    }

    fn encode(&self, four_octet_as: bool, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let mut value = BytesMut::new();
        self.encode_value(four_octet_as, &mut value);
        let code = self.code();
        let len = u16::try_from(value.len())
            .map_err(|source| EncodeError::AttributeTooLong { code, source })?;
        match u8::try_from(len) {
            Ok(short) => {
                dst.put_u8(self.flags());
                dst.put_u8(code);
                dst.put_u8(short);
            }
            Err(_) => {
                dst.put_u8(self.flags() | FLAG_EXTENDED_LENGTH);
                dst.put_u8(code);
                dst.put_u16(len);
            }
        }
        dst.put_slice(&value);
        Ok(())
    }

    fn decode(flags: u8, code: u8, value: &[u8], four_octet_as: bool) -> Result<Self, DecodeError> {
        if let Some(expected) = expected_flags(code) {
            if flags & (FLAG_OPTIONAL | FLAG_TRANSITIVE) != expected {
                return Err(DecodeError::AttributeFlagsError(code));
            }
        }
        let length_error = || DecodeError::AttributeLengthError(code);
        let attribute = match code {
            ATTR_ORIGIN => match value {
                [0] => PathAttribute::Origin(Origin::Igp),
                [1] => PathAttribute::Origin(Origin::Egp),
                [2] => PathAttribute::Origin(Origin::Incomplete),
                [other] => return Err(DecodeError::InvalidOrigin(*other)),
                _ => return Err(length_error()),
            },
            ATTR_AS_PATH => PathAttribute::AsPath(decode_as_path(value, four_octet_as)?),
            ATTR_NEXT_HOP => match value {
                [a, b, c, d] => {
                    let ip = Ipv4Addr::new(*a, *b, *c, *d);
                    if ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast() {
                        return Err(DecodeError::InvalidNextHop);
                    }
                    PathAttribute::NextHop(ip)
                }
                _ => return Err(length_error()),
            },
            ATTR_MULTI_EXIT_DISC | ATTR_LOCAL_PREF => {
                let [a, b, c, d] = value else {
                    return Err(length_error());
                };
                let v = u32::from_be_bytes([*a, *b, *c, *d]);
                if code == ATTR_LOCAL_PREF {
                    PathAttribute::LocalPref(v)
                } else {
                    PathAttribute::MultiExitDisc(v)
                }
            }
            ATTR_ATOMIC_AGGREGATE => {
                if !value.is_empty() {
                    return Err(length_error());
                }
                PathAttribute::AtomicAggregate
            }
            ATTR_COMMUNITIES => {
                if value.len() % 4 != 0 {
                    return Err(length_error());
                }
                PathAttribute::Communities(
                    value
                        .chunks_exact(4)
                        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            ATTR_MP_REACH_NLRI => match decode_mp_reach(value)? {
                Some(reach) => PathAttribute::MpReach(reach),
                None => PathAttribute::Unknown { flags, code, value: value.to_vec() },
            },
            ATTR_MP_UNREACH_NLRI => match decode_mp_unreach(value)? {
                Some(unreach) => PathAttribute::MpUnreach(unreach),
                None => PathAttribute::Unknown { flags, code, value: value.to_vec() },
            },
            _ if flags & FLAG_OPTIONAL == 0 => {
                return Err(DecodeError::UnrecognizedWellKnownAttribute(code));
            }
            _ => PathAttribute::Unknown { flags, code, value: value.to_vec() },
        };
        Ok(attribute)
    }
}

/// Optional/transitive bits every known attribute must carry.
fn expected_flags(code: u8) -> Option<u8> {
    match code {
        ATTR_ORIGIN | ATTR_AS_PATH | ATTR_NEXT_HOP | ATTR_LOCAL_PREF | ATTR_ATOMIC_AGGREGATE => {
            Some(FLAG_TRANSITIVE)
        }
        ATTR_MULTI_EXIT_DISC | ATTR_MP_REACH_NLRI | ATTR_MP_UNREACH_NLRI => Some(FLAG_OPTIONAL),
        ATTR_COMMUNITIES => Some(FLAG_OPTIONAL | FLAG_TRANSITIVE),
        _ => None,
    }
}

fn decode_as_path(value: &[u8], four_octet_as: bool) -> Result<Vec<AsSegment>, DecodeError> {
    let width = if four_octet_as { 4 } else { 2 };
    let mut reader = Reader::new(value);
    let mut segments = Vec::new();
    while !reader.is_empty() {
        let kind = match reader.u8() {
            Some(1) => AsSegmentType::Set,
            Some(2) => AsSegmentType::Sequence,
            _ => return Err(DecodeError::MalformedAsPath),
        };
        let count = reader.u8().ok_or(DecodeError::MalformedAsPath)?;
        let raw = reader
            .take(usize::from(count) * width)
            .ok_or(DecodeError::MalformedAsPath)?;
        let asns = raw
            .chunks_exact(width)
            .map(|chunk| match chunk {
                [a, b, c, d] => u32::from_be_bytes([*a, *b, *c, *d]),
                [a, b] => u32::from(u16::from_be_bytes([*a, *b])),
                _ => 0,
            })
            .collect();
        segments.push(AsSegment { kind, asns });
    }
    Ok(segments)
}

fn family_of(reader: &mut Reader<'_>, code: u8) -> Result<Option<AddressFamily>, DecodeError> {
    let afi = reader.u16().ok_or(DecodeError::OptionalAttributeError(code))?;
    let safi = reader.u8().ok_or(DecodeError::OptionalAttributeError(code))?;
    Ok(AddressFamily::from_afi_safi(afi, safi))
}

fn prefix_family(family: AddressFamily) -> PrefixFamily {
    match family {
        AddressFamily::Ipv4Unicast => PrefixFamily::V4,
        AddressFamily::Ipv6Unicast => PrefixFamily::V6,
    }
}

fn decode_mp_reach(value: &[u8]) -> Result<Option<MpReach>, DecodeError> {
    let error = || DecodeError::OptionalAttributeError(ATTR_MP_REACH_NLRI);
    let mut reader = Reader::new(value);
    let Some(family) = family_of(&mut reader, ATTR_MP_REACH_NLRI)? else {
        return Ok(None);
    };
    let hop_len = reader.u8().ok_or_else(error)?;
    let hops = reader.take(usize::from(hop_len)).ok_or_else(error)?;
    let next_hops = match (family, hops.len()) {
        (AddressFamily::Ipv4Unicast, 4) => vec![IpAddr::V4(Ipv4Addr::new(hops[0], hops[1], hops[2], hops[3]))],
        (AddressFamily::Ipv6Unicast, 16 | 32) => hops
            .chunks_exact(16)
            .map(|c| {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(c);
                IpAddr::V6(Ipv6Addr::from(octets))
            })
            .collect(),
        _ => return Err(error()),
    };
    reader.u8().ok_or_else(error)?;
    let nlri = decode_prefixes(reader.rest(), prefix_family(family))?;
    Ok(Some(MpReach { family, next_hops, nlri }))
}

fn decode_mp_unreach(value: &[u8]) -> Result<Option<MpUnreach>, DecodeError> {
    let mut reader = Reader::new(value);
    let Some(family) = family_of(&mut reader, ATTR_MP_UNREACH_NLRI)? else {
        return Ok(None);
    };
    let withdrawn = decode_prefixes(reader.rest(), prefix_family(family))?;
    Ok(Some(MpUnreach { family, withdrawn }))
}

/// An UPDATE message.
///
/// `withdrawn` and `nlri` carry IPv4 prefixes only; other families travel in
/// the multiprotocol attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    /// Withdrawn IPv4 prefixes
    pub withdrawn: Vec<IpNet>,
    /// Path attributes
    pub attributes: Vec<PathAttribute>,
    /// Reachable IPv4 prefixes
    pub nlri: Vec<IpNet>,
}

impl Update {
    /// First attribute with the given code.
    #[must_use]
    pub fn attribute(&self, code: u8) -> Option<&PathAttribute> {
        self.attributes.iter().find(|a| a.code() == code)
    }

    /// LOCAL_PREF, if present.
    #[must_use]
    pub fn local_pref(&self) -> Option<u32> {
        match self.attribute(ATTR_LOCAL_PREF) {
            Some(PathAttribute::LocalPref(value)) => Some(*value),
            _ => None,
        }
    }

    /// COMMUNITIES, empty if absent.
    #[must_use]
    pub fn communities(&self) -> Vec<u32> {
        match self.attribute(ATTR_COMMUNITIES) {
            Some(PathAttribute::Communities(values)) => values.clone(),
            _ => Vec::new(),
        }
    }

    /// AS_PATH flattened to a list of ASNs.
    #[must_use]
    pub fn as_path(&self) -> Option<Vec<u32>> {
        match self.attribute(ATTR_AS_PATH) {
            Some(PathAttribute::AsPath(segments)) => {
                Some(segments.iter().flat_map(|s| s.asns.iter().copied()).collect())
            }
            _ => None,
        }
    }

    /// Every prefix announced, IPv4 NLRI and MP_REACH_NLRI.
    #[must_use]
    pub fn announced(&self) -> Vec<IpNet> {
        let mut out = self.nlri.clone();
        for attribute in &self.attributes {
            if let PathAttribute::MpReach(reach) = attribute {
                out.extend(reach.nlri.iter().copied());
            }
        }
        out
    }

    /// Every prefix withdrawn, IPv4 and MP_UNREACH_NLRI.
    #[must_use]
    pub fn withdrawn_all(&self) -> Vec<IpNet> {
        let mut out = self.withdrawn.clone();
        for attribute in &self.attributes {
            if let PathAttribute::MpUnreach(unreach) = attribute {
                out.extend(unreach.withdrawn.iter().copied());
            }
        }
        out
    }

    pub(crate) fn encode_body(&self, four_octet_as: bool, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let mut withdrawn = BytesMut::new();
        for prefix in &self.withdrawn {
            encode_prefix(prefix, &mut withdrawn);
        }
        let mut attributes = BytesMut::new();
        for attribute in &self.attributes {
            attribute.encode(four_octet_as, &mut attributes)?;
        }
        dst.put_u16(u16::try_from(withdrawn.len())?);
        dst.put_slice(&withdrawn);
        dst.put_u16(u16::try_from(attributes.len())?);
        dst.put_slice(&attributes);
        for prefix in &self.nlri {
            encode_prefix(prefix, dst);
        }
        Ok(())
    }

    pub(crate) fn decode_body(body: &[u8], four_octet_as: bool) -> Result<Self, DecodeError> {
        let malformed = |what: &str| DecodeError::MalformedAttributeList(what.to_string());
        let mut reader = Reader::new(body);

        let withdrawn_len = reader.u16().ok_or_else(|| malformed("missing withdrawn length"))?;
        let withdrawn = reader
            .take(usize::from(withdrawn_len))
            .ok_or_else(|| malformed("withdrawn routes overrun the message"))?;
        let withdrawn = decode_prefixes(withdrawn, PrefixFamily::V4)?;

        let attrs_len = reader.u16().ok_or_else(|| malformed("missing attribute length"))?;
        let attrs = reader
            .take(usize::from(attrs_len))
            .ok_or_else(|| malformed("path attributes overrun the message"))?;
        let nlri = decode_prefixes(reader.rest(), PrefixFamily::V4)?;

        let mut attributes: Vec<PathAttribute> = Vec::new();
        let mut attrs = Reader::new(attrs);
        while !attrs.is_empty() {
            let flags = attrs.u8().ok_or_else(|| malformed("truncated attribute"))?;
            let code = attrs.u8().ok_or_else(|| malformed("truncated attribute"))?;
            let len = if flags & FLAG_EXTENDED_LENGTH != 0 {
                attrs.u16().map(usize::from)
            } else {
                attrs.u8().map(usize::from)
            }
            .ok_or_else(|| malformed("truncated attribute"))?;
            let value = attrs
                .take(len)
                .ok_or(DecodeError::AttributeLengthError(code))?;
            if attributes.iter().any(|a| a.code() == code) {
                return Err(malformed(&format!("attribute {code} appears twice")));
            }
            attributes.push(PathAttribute::decode(flags, code, value, four_octet_as)?);
        }

        let update = Self { withdrawn, attributes, nlri };
        let has_mp_reach = update.attribute(ATTR_MP_REACH_NLRI).is_some();
        if !update.nlri.is_empty() || has_mp_reach {
            let mut mandatory = vec![ATTR_ORIGIN, ATTR_AS_PATH];
            if !update.nlri.is_empty() {
                mandatory.push(ATTR_NEXT_HOP);
            }
            if let Some(missing) = mandatory.into_iter().find(|c| update.attribute(*c).is_none()) {
                return Err(DecodeError::MissingWellKnownAttribute(missing));
            }
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ipv4_update() -> Update {
        Update {
            withdrawn: vec![net("10.0.0.9/32")],
            attributes: vec![
                PathAttribute::Origin(Origin::Incomplete),
                PathAttribute::AsPath(vec![AsSegment::sequence(vec![64512])]),
                PathAttribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)),
                PathAttribute::LocalPref(100),
                PathAttribute::Communities(vec![0xFDE8_0001]),
            ],
            nlri: vec![net("10.0.0.1/32")],
        }
    }

    #[test]
    fn test_ipv4_update_wire_format() {
        let bytes = Message::Update(ipv4_update()).to_bytes(true).unwrap();
        let body = &bytes[19..];
        assert_eq!(
            body,
            &[
                0, 5, 32, 10, 0, 0, 9, // withdrawn
                0, 34, // attribute length
                0x40, 1, 1, 2, // ORIGIN incomplete
                0x40, 2, 6, 2, 1, 0, 0, 0xFC, 0x00, // AS_PATH
                0x40, 3, 4, 192, 0, 2, 1, // NEXT_HOP
                0x40, 5, 4, 0, 0, 0, 100, // LOCAL_PREF
                0xC0, 8, 4, 0xFD, 0xE8, 0, 1, // COMMUNITIES
                32, 10, 0, 0, 1, // NLRI
            ]
        );
        assert_eq!(Message::decode(&bytes, true).unwrap(), Message::Update(ipv4_update()));
    }

    #[test]
    fn test_two_octet_as_path() {
        let mut update = ipv4_update();
        update.attributes[1] = PathAttribute::AsPath(vec![AsSegment::sequence(vec![65001, 4_200_000_000])]);
        let bytes = Message::Update(update).to_bytes(false).unwrap();
        let decoded = match Message::decode(&bytes, false).unwrap() {
            Message::Update(u) => u,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(decoded.as_path(), Some(vec![65001, u32::from(AS_TRANS)]));
    }

    #[test]
    fn test_ipv6_update() {
        let update = Update {
            withdrawn: vec![],
            attributes: vec![
                PathAttribute::Origin(Origin::Incomplete),
                PathAttribute::AsPath(vec![]),
                PathAttribute::MpReach(MpReach {
                    family: AddressFamily::Ipv6Unicast,
                    next_hops: vec!["2001:db8::1".parse().unwrap()],
                    nlri: vec![net("2001:db8:1::5/128")],
                }),
                PathAttribute::MpUnreach(MpUnreach {
                    family: AddressFamily::Ipv6Unicast,
                    withdrawn: vec![net("2001:db8:1::6/128")],
                }),
            ],
            nlri: vec![],
        };
        let bytes = Message::Update(update.clone()).to_bytes(true).unwrap();
        let decoded = Message::decode(&bytes, true).unwrap();
        assert_eq!(decoded, Message::Update(update.clone()));
        assert_eq!(update.announced(), vec![net("2001:db8:1::5/128")]);
        assert_eq!(update.withdrawn_all(), vec![net("2001:db8:1::6/128")]);
    }

    #[test]
    fn test_extended_length_attribute() {
        let communities: Vec<u32> = (0..100).collect();
        let mut update = ipv4_update();
        update.attributes[4] = PathAttribute::Communities(communities.clone());
        let bytes = Message::Update(update).to_bytes(true).unwrap();
        let decoded = match Message::decode(&bytes, true).unwrap() {
            Message::Update(u) => u,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(decoded.communities(), communities);
    }

    #[test]
    fn test_missing_next_hop() {
        let mut update = ipv4_update();
        update.attributes.remove(2);
        let bytes = Message::Update(update).to_bytes(true).unwrap();
        assert_eq!(
            Message::decode(&bytes, true),
            Err(DecodeError::MissingWellKnownAttribute(ATTR_NEXT_HOP))
        );
    }

    #[test]
    fn test_bad_origin_and_flags() {
        let mut update = ipv4_update();
        update.attributes[0] = PathAttribute::Unknown { flags: 0x40, code: ATTR_ORIGIN, value: vec![7] };
        let bytes = Message::Update(update).to_bytes(true).unwrap();
        assert_eq!(Message::decode(&bytes, true), Err(DecodeError::InvalidOrigin(7)));

        let mut update = ipv4_update();
        update.attributes[0] = PathAttribute::Unknown { flags: 0xC0, code: ATTR_ORIGIN, value: vec![0] };
        let bytes = Message::Update(update).to_bytes(true).unwrap();
        assert_eq!(
            Message::decode(&bytes, true),
            Err(DecodeError::AttributeFlagsError(ATTR_ORIGIN))
        );
    }

    #[test]
    fn test_unknown_attributes() {
        let mut update = ipv4_update();
        update.attributes.push(PathAttribute::Unknown { flags: 0xC0, code: 99, value: vec![1, 2] });
        let bytes = Message::Update(update.clone()).to_bytes(true).unwrap();
        assert_eq!(Message::decode(&bytes, true).unwrap(), Message::Update(update));

        let mut update = ipv4_update();
        update.attributes.push(PathAttribute::Unknown { flags: 0x40, code: 99, value: vec![] });
        let bytes = Message::Update(update).to_bytes(true).unwrap();
        assert_eq!(
            Message::decode(&bytes, true),
            Err(DecodeError::UnrecognizedWellKnownAttribute(99))
        );
    }

    #[test]
    fn test_duplicate_attribute() {
        let mut update = ipv4_update();
        update.attributes.push(PathAttribute::LocalPref(5));
        let bytes = Message::Update(update).to_bytes(true).unwrap();
        assert!(matches!(
            Message::decode(&bytes, true),
            Err(DecodeError::MalformedAttributeList(_))
        ));
    }

    #[test]
    fn test_withdrawn_length_overrun() {
        let mut bytes = Message::Update(Update::default()).to_bytes(true).unwrap().to_vec();
        bytes[20] = 50;
        assert!(matches!(
            Message::decode(&bytes, true),
            Err(DecodeError::MalformedAttributeList(_))
        ));
    }

    #[test]
    fn test_end_of_rib_marker() {
        let bytes = Message::Update(Update::default()).to_bytes(true).unwrap();
        assert_eq!(bytes.len(), 23);
        assert_eq!(Message::decode(&bytes, true).unwrap(), Message::Update(Update::default()));
    }

    #[test]
    fn test_truncated_update_frame() {
        let bytes = Message::Update(ipv4_update()).to_bytes(true).unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert_eq!(
            Message::decode(cut, true),
            Err(DecodeError::TruncatedMessage { declared: bytes.len(), available: bytes.len() - 3 })
        );
    }

    #[test]
    fn test_oversized_attribute_rejected() {
        let mut update = ipv4_update();
        update.attributes.push(PathAttribute::Unknown { flags: 0xC0, code: 99, value: vec![0; 70_000] });
        let err = Message::Update(update).to_bytes(true).unwrap_err();
        assert!(matches!(err, EncodeError::AttributeTooLong { code: 99, .. }));
        assert!(err.to_string().starts_with("attribute 99 is too long: "));
    }
}
