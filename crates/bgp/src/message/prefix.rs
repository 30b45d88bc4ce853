//! NLRI prefix encoding (RFC 4271 §4.3): a length in bits followed by the
//! minimal number of address bytes.

use super::Reader;
use crate::error::DecodeError;
use bytes::BufMut;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Encoded size of a prefix, length byte included.
#[must_use]
pub fn encoded_len(prefix: &IpNet) -> usize {
    1 + usize::from(prefix.prefix_len()).div_ceil(8)
}

/// Appends one prefix.
pub fn encode_prefix(prefix: &IpNet, dst: &mut impl BufMut) {
    let len = prefix.prefix_len();
    let bytes = usize::from(len).div_ceil(8);
    dst.put_u8(len);
    match prefix.trunc() {
        IpNet::V4(net) => dst.put_slice(&net.network().octets()[..bytes]),
        IpNet::V6(net) => dst.put_slice(&net.network().octets()[..bytes]),
    }
}

/// Which family a prefix list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrefixFamily {
    V4,
    V6,
}

/// Decodes prefixes until `buf` is exhausted.
///
/// Rejects lengths wider than the family, bytes missing, and host bits set
/// beyond the prefix length.
pub(crate) fn decode_prefixes(buf: &[u8], family: PrefixFamily) -> Result<Vec<IpNet>, DecodeError> {
    let mut reader = Reader::new(buf);
    let mut out = Vec::new();
    while !reader.is_empty() {
        out.push(decode_prefix(&mut reader, family)?);
    }
    Ok(out)
}

fn decode_prefix(reader: &mut Reader<'_>, family: PrefixFamily) -> Result<IpNet, DecodeError> {
    let invalid = |reason: String| DecodeError::InvalidNetworkField(reason);
    let len = reader.u8().ok_or_else(|| invalid("missing prefix length".to_string()))?;
    let width = match family {
        PrefixFamily::V4 => 32,
        PrefixFamily::V6 => 128,
    };
    if len > width {
        return Err(invalid(format!("prefix length {len} exceeds {width}")));
    }
    let bytes = reader
        .take(usize::from(len).div_ceil(8))
        .ok_or_else(|| invalid(format!("prefix /{len} is cut short")))?;

    let net = match family {
        PrefixFamily::V4 => {
            let mut octets = [0u8; 4];
            octets[..bytes.len()].copy_from_slice(bytes);
            IpNet::V4(
                Ipv4Net::new(Ipv4Addr::from(octets), len)
                    .map_err(|e| invalid(e.to_string()))?,
            )
        }
        PrefixFamily::V6 => {
            let mut octets = [0u8; 16];
            octets[..bytes.len()].copy_from_slice(bytes);
            IpNet::V6(
                Ipv6Net::new(Ipv6Addr::from(octets), len)
                    .map_err(|e| invalid(e.to_string()))?,
            )
        }
    };
    if net.trunc() != net {
        return Err(invalid(format!("{net} has host bits set")));
    }
    Ok(net)
}
