//! Outbound connections to peers.
//!
//! Sessions never open sockets themselves; they ask a [`Dialer`]. Production
//! uses [`TcpDialer`], tests hand out in-memory pipes.

use crate::md5;
use crate::peer::PeerConfig;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tracing::debug;

/// Connect timeout used by [`TcpDialer::default`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// An established connection.
pub struct Connection {
    /// The stream
    pub stream: Box<dyn Transport>,
    /// Local address of the connection; used as NEXT_HOP and router id
    pub local_addr: IpAddr,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Opens connections to peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `peer`, applying its socket options.
    async fn dial(&self, peer: &PeerConfig) -> io::Result<Connection>;
}

/// Dials real TCP connections.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl TcpDialer {
    /// A dialer giving up on a connect after `connect_timeout`.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Creates the socket with every option that must be set before SYN.
    fn socket(peer: &PeerConfig, remote: SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        if let Some(password) = &peer.password {
            md5::set_md5_signature(&socket, remote, password)?;
        }
        if let Some(source) = peer.source_address {
            socket.bind(&SocketAddr::new(source, 0).into())?;
        }
        Ok(socket)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, peer: &PeerConfig) -> io::Result<Connection> {
        let remote = peer.endpoint();
        let socket = Self::socket(peer, remote)?;
        let socket = TcpSocket::from_std_stream(std::net::TcpStream::from(socket));

        debug!("Connecting to BGP peer {} at {}", peer.name, remote);
        let stream = tokio::time::timeout(self.connect_timeout, socket.connect(remote))
            .await
            .map_err(|elapsed| io::Error::new(io::ErrorKind::TimedOut, elapsed))??;
        let local_addr = stream.local_addr()?.ip();
        Ok(Connection {
            stream: Box::new(stream),
            local_addr,
        })
    }
}
