//! TCP MD5 signature option (RFC 2385).
//!
//! Linux only. The key must be installed before connect so that the SYN is
//! already signed.

use socket2::Socket;
use std::io;
use std::net::SocketAddr;

/// Longest key the kernel accepts.
pub const MAX_KEY_LEN: usize = 80;

fn check_key(key: &[u8]) -> io::Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("TCP MD5 key must be 1 to {MAX_KEY_LEN} bytes, got {}", key.len()),
        ));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{MAX_KEY_LEN, check_key};
    use std::io;
    use std::net::SocketAddr;

    // struct tcp_md5sig: 128-byte sockaddr_storage, u8 flags, u8 prefixlen,
    // u16 keylen, i32 ifindex, then the key.
    const KEYLEN_OFFSET: usize = 130;
    const KEY_OFFSET: usize = 136;
    pub(super) const TCP_MD5SIG_LEN: usize = KEY_OFFSET + MAX_KEY_LEN;

    fn family(af: libc::c_int) -> [u8; 2] {
        u16::try_from(af).unwrap_or(0).to_ne_bytes()
    }

    pub(super) fn md5sig(peer: SocketAddr, key: &[u8]) -> io::Result<[u8; TCP_MD5SIG_LEN]> {
        check_key(key)?;
        let mut buf = [0u8; TCP_MD5SIG_LEN];
        match peer {
            SocketAddr::V4(v4) => {
                buf[0..2].copy_from_slice(&family(libc::AF_INET));
                buf[2..4].copy_from_slice(&v4.port().to_be_bytes());
                buf[4..8].copy_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                buf[0..2].copy_from_slice(&family(libc::AF_INET6));
                buf[2..4].copy_from_slice(&v6.port().to_be_bytes());
                buf[8..24].copy_from_slice(&v6.ip().octets());
            }
        }
        let key_len = u16::try_from(key.len()).unwrap_or(0);
        buf[KEYLEN_OFFSET..KEYLEN_OFFSET + 2].copy_from_slice(&key_len.to_ne_bytes());
        buf[KEY_OFFSET..KEY_OFFSET + key.len()].copy_from_slice(key);
        Ok(buf)
    }
}

/// Installs `password` as the MD5 signature key for connections to `peer`.
#[cfg(target_os = "linux")]
pub fn set_md5_signature(socket: &Socket, peer: SocketAddr, password: &str) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let sig = linux::md5sig(peer, password.as_bytes())?;
    let len = libc::socklen_t::try_from(sig.len())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    #[allow(unsafe_code, reason = "setsockopt has no safe wrapper for TCP_MD5SIG")]
    // SAFETY: `sig` is an initialised buffer of exactly `len` bytes laid out
    // as `struct tcp_md5sig`, and the fd stays open for the borrow of `socket`.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_MD5SIG,
            sig.as_ptr().cast::<libc::c_void>(),
            len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Installs `password` as the MD5 signature key for connections to `peer`.
#[cfg(not(target_os = "linux"))]
pub fn set_md5_signature(_socket: &Socket, _peer: SocketAddr, password: &str) -> io::Result<()> {
    check_key(password.as_bytes())?;
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP MD5 signatures are only supported on Linux",
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::linux::{TCP_MD5SIG_LEN, md5sig};

    #[test]
    fn test_md5sig_layout_v4() {
        let buf = md5sig("192.0.2.7:179".parse().unwrap(), b"secret").unwrap();
        assert_eq!(TCP_MD5SIG_LEN, 216);
        assert_eq!(
            i32::from(u16::from_ne_bytes([buf[0], buf[1]])),
            libc::AF_INET
        );
        assert_eq!(&buf[2..4], &179u16.to_be_bytes());
        assert_eq!(&buf[4..8], &[192, 0, 2, 7]);
        assert_eq!(u16::from_ne_bytes([buf[130], buf[131]]), 6);
        assert_eq!(&buf[136..142], b"secret");
        assert!(buf[142..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_md5sig_layout_v6() {
        let buf = md5sig("[2001:db8::7]:179".parse().unwrap(), b"k").unwrap();
        assert_eq!(
            i32::from(u16::from_ne_bytes([buf[0], buf[1]])),
            libc::AF_INET6
        );
        assert_eq!(buf[8], 0x20);
        assert_eq!(buf[23], 7);
    }

    #[test]
    fn test_md5sig_key_length_limits() {
        let peer = "192.0.2.7:179".parse().unwrap();
        assert!(md5sig(peer, b"").is_err());
        assert!(md5sig(peer, &[b'a'; 81]).is_err());
        assert!(md5sig(peer, &[b'a'; 80]).is_ok());
    }
}
