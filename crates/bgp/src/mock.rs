//! In-memory peers for tests.
//!
//! [`DuplexDialer`] hands sessions one end of a `tokio::io::duplex` pipe and
//! passes the other end to the test, which drives it with [`MockPeer`].

use crate::codec::BgpCodec;
use crate::dial::{Connection, Dialer};
use crate::error::CodecError;
use crate::message::{AddressFamily, Message, Open, Update};
use crate::peer::PeerConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Local address sessions see on IPv4 connections.
pub const LOCAL_V4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
/// Local address sessions see on IPv6 connections.
pub const LOCAL_V6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);

/// The far end of a dialed connection.
#[derive(Debug)]
pub struct Accepted {
    /// Name of the peer the session dialed
    pub peer: String,
    /// Stream to play the peer on
    pub stream: DuplexStream,
}

/// A [`Dialer`] producing in-memory connections.
#[derive(Debug, Clone)]
pub struct DuplexDialer {
    accepted: mpsc::UnboundedSender<Accepted>,
    refuse: Arc<AtomicBool>,
}

impl DuplexDialer {
    /// A dialer and the receiver of every connection it makes.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                refuse: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Makes subsequent dials fail with `ConnectionRefused`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dialer for DuplexDialer {
    async fn dial(&self, peer: &PeerConfig) -> io::Result<Connection> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        let (client, server) = duplex(PIPE_CAPACITY);
        self.accepted
            .send(Accepted {
                peer: peer.name.clone(),
                stream: server,
            })
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        let local_addr = match peer.address {
            IpAddr::V4(_) => IpAddr::V4(LOCAL_V4),
            IpAddr::V6(_) => IpAddr::V6(LOCAL_V6),
        };
        Ok(Connection {
            stream: Box::new(client),
            local_addr,
        })
    }
}

fn unexpected(expected: &str, got: &Message) -> CodecError {
    CodecError::Io(io::Error::other(format!("expected {expected}, got {}", got.name())))
}

fn closed() -> CodecError {
    CodecError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
}

/// The router side of a session.
#[derive(Debug)]
pub struct MockPeer {
    framed: Framed<DuplexStream, BgpCodec>,
}

impl MockPeer {
    /// Wraps the accepted stream.
    #[must_use]
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, BgpCodec::new()),
        }
    }

    /// Next message from the session; `None` once it closed.
    pub async fn recv(&mut self) -> Option<Result<Message, CodecError>> {
        self.framed.next().await
    }

    /// Sends a message to the session.
    pub async fn send(&mut self, message: Message) -> Result<(), CodecError> {
        self.framed.send(message).await
    }

    /// Writes bytes without framing, for malformed input.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    /// Closes the write half; the session sees EOF.
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        self.framed.get_mut().shutdown().await
    }

    /// Plays the OPEN/KEEPALIVE exchange up to Established and returns the
    /// session's OPEN.
    pub async fn handshake(
        &mut self,
        asn: u32,
        hold_time: u16,
        router_id: Ipv4Addr,
    ) -> Result<Open, CodecError> {
        let theirs = match self.recv().await.ok_or_else(closed)?? {
            Message::Open(open) => open,
            other => return Err(unexpected("OPEN", &other)),
        };
        let ours = Open::new(
            asn,
            hold_time,
            router_id,
            &[AddressFamily::Ipv4Unicast, AddressFamily::Ipv6Unicast],
        );
        self.send(Message::Open(ours)).await?;
        self.send(Message::Keepalive).await?;
        match self.recv().await.ok_or_else(closed)?? {
            Message::Keepalive => {}
            other => return Err(unexpected("KEEPALIVE", &other)),
        }
        self.framed
            .codec_mut()
            .set_four_octet_as(theirs.supports_four_octet_as());
        Ok(theirs)
    }

    /// Next UPDATE, skipping KEEPALIVEs.
    pub async fn next_update(&mut self) -> Result<Update, CodecError> {
        loop {
            match self.recv().await.ok_or_else(closed)?? {
                Message::Keepalive => {}
                Message::Update(update) => return Ok(update),
                other => return Err(unexpected("UPDATE", &other)),
            }
        }
    }
}
