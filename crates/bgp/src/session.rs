//! # Session driver
//!
//! One tokio task per peer. The task owns the connection, the timers, the
//! table of routes the speaker wants advertised and the table the peer has
//! actually been sent. It feeds [`Event`]s to the pure FSM in [`crate::fsm`]
//! and carries out the returned [`Action`]s.
//!
//! The speaker talks to the task only through a bounded command queue, so a
//! stuck peer never blocks route delivery to the others.

use crate::backoff::ExponentialBackoff;
use crate::codec::BgpCodec;
use crate::dial::{Connection, Dialer, Transport};
use crate::error::CodecError;
use crate::fsm::{self, Action, Event, FsmConfig, SessionState, State};
use crate::message::{AddressFamily, Message};
use crate::peer::PeerConfig;
use crate::route::{self, PathContext, Route};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::pending;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Commands buffered per session before the speaker falls back to a resync.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Bound on any single write, including the final Cease.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`SessionHandle::shutdown`] waits before aborting the task.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Changes to the routes a session should advertise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Incremental change against the previous command
    Diff {
        /// Prefixes to stop advertising
        withdraw: Vec<IpNet>,
        /// Routes to add or replace
        advertise: Vec<Route>,
    },
    /// The complete table, replacing whatever came before
    Replace(Vec<Route>),
}

/// Snapshot of a session for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Peer name
    pub peer: String,
    /// FSM state
    pub state: SessionState,
    /// Why the session last went down
    pub last_error: Option<String>,
    /// Prefixes the peer currently holds from us
    pub advertised_prefixes: usize,
    /// UPDATE messages sent over the session's lifetime
    pub updates_sent: u64,
    /// Connection attempts over the session's lifetime
    pub connect_attempts: u64,
    /// When `state` was entered
    pub since: DateTime<Utc>,
    /// Negotiated hold time once OPENs have been exchanged
    pub negotiated_hold_time: Option<u16>,
}

impl SessionStatus {
    fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
            state: SessionState::Idle,
            last_error: None,
            advertised_prefixes: 0,
            updates_sent: 0,
            connect_attempts: 0,
            since: Utc::now(),
            negotiated_hold_time: None,
        }
    }
}

/// Called on every status change.
pub type StatusCallback = Arc<dyn Fn(&SessionStatus) + Send + Sync>;

/// The speaker's end of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    peer: String,
    commands: mpsc::Sender<SessionCommand>,
    stop: Option<oneshot::Sender<()>>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queues a command without waiting.
    pub fn try_send(&self, command: SessionCommand) -> Result<(), mpsc::error::TrySendError<SessionCommand>> {
        self.commands.try_send(command)
    }

    /// Latest status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Stops the session: Cease to the peer, close, end the task.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            // The task may already be gone.
            let _ = stop.send(());
        }
        if timeout(SHUTDOWN_TIMEOUT, &mut self.task).await.is_err() {
            warn!("BGP session to peer {} did not stop in time, aborting", self.peer);
            self.task.abort();
        }
    }
}

/// Starts a session task for `config`.
///
/// The session begins in Idle and immediately tries to connect.
#[must_use]
pub fn spawn(
    config: PeerConfig,
    node_name: &str,
    dialer: Arc<dyn Dialer>,
    callback: Option<StatusCallback>,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (stop_tx, stop_rx) = oneshot::channel();
    let status = SessionStatus::new(&config.name);
    let (status_tx, status_rx) = watch::channel(status.clone());
    let peer = config.name.clone();

    let fsm_config = FsmConfig {
        local_asn: config.local_asn,
        peer_asn: config.peer_asn,
        hold_time: config.hold_time_secs(),
        router_id: config.router_id.unwrap_or(Ipv4Addr::UNSPECIFIED),
        families: vec![AddressFamily::Ipv4Unicast, AddressFamily::Ipv6Unicast],
    };
    let session = Session {
        config,
        fsm_config,
        node_name: node_name.to_string(),
        dialer,
        state: State::Idle,
        framed: None,
        local_addr: None,
        connecting: None,
        reconnect_at: None,
        hold_at: None,
        keepalive_at: None,
        backoff: ExponentialBackoff::default(),
        desired: BTreeMap::new(),
        advertised: BTreeMap::new(),
        status,
        status_tx,
        callback,
    };
    let task = tokio::spawn(session.run(command_rx, stop_rx));

    SessionHandle {
        peer,
        commands: command_tx,
        stop: Some(stop_tx),
        status: status_rx,
        task,
    }
}

/// Router id: configured, else the local IPv4 address, else a hash of the
/// node name.
pub(crate) fn router_id(config: &PeerConfig, local: IpAddr, node_name: &str) -> Ipv4Addr {
    if let Some(id) = config.router_id {
        return id;
    }
    if let IpAddr::V4(v4) = local {
        if !v4.is_unspecified() {
            return v4;
        }
    }
    // FNV-1a
    let hash = node_name.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    });
    Ipv4Addr::from(hash.max(1))
}

type PeerStream = Framed<Box<dyn Transport>, BgpCodec>;

struct Session {
    config: PeerConfig,
    fsm_config: FsmConfig,
    node_name: String,
    dialer: Arc<dyn Dialer>,
    state: State,
    framed: Option<PeerStream>,
    local_addr: Option<IpAddr>,
    connecting: Option<BoxFuture<'static, io::Result<Connection>>>,
    reconnect_at: Option<Instant>,
    hold_at: Option<Instant>,
    keepalive_at: Option<Instant>,
    backoff: ExponentialBackoff,
    /// Routes the speaker wants this peer to have
    desired: BTreeMap<IpNet, Route>,
    /// Routes the peer has been sent on the current connection
    advertised: BTreeMap<IpNet, Route>,
    status: SessionStatus,
    status_tx: watch::Sender<SessionStatus>,
    callback: Option<StatusCallback>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn poll_connecting(
    connecting: &mut Option<BoxFuture<'static, io::Result<Connection>>>,
) -> io::Result<Connection> {
    match connecting {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn read_next(framed: &mut Option<PeerStream>) -> Option<Result<Message, CodecError>> {
    match framed {
        Some(framed) => framed.next().await,
        None => pending().await,
    }
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut stop: oneshot::Receiver<()>,
    ) {
        info!(
            "Starting BGP session to peer {} at {} (AS {})",
            self.config.name,
            self.config.endpoint(),
            self.config.peer_asn
        );
        self.handle(Event::Start).await;

        loop {
            // Route commands go before socket input so that a table change
            // queued ahead of the peer's KEEPALIVE is part of the full table.
            let event = tokio::select! {
                biased;
                _ = &mut stop => break,
                command = commands.recv() => match command {
                    Some(command) => {
                        self.apply(command).await;
                        continue;
                    }
                    None => break,
                },
                () = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    Event::Start
                }
                () = sleep_until_opt(self.hold_at) => {
                    self.hold_at = None;
                    Event::HoldTimerExpired
                }
                () = sleep_until_opt(self.keepalive_at) => {
                    self.keepalive_at = None;
                    Event::KeepaliveTimerExpired
                }
                result = poll_connecting(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(connection) => self.attach(connection),
                        Err(e) => Event::TcpFailed(format!("connect to {} failed: {}", self.config.endpoint(), e)),
                    }
                }
                frame = read_next(&mut self.framed) => match frame {
                    Some(Ok(message)) => Event::MessageReceived(message),
                    Some(Err(CodecError::Decode(e))) => Event::DecodeFailed(e),
                    Some(Err(e)) => {
                        debug!("Read from BGP peer {} failed: {}", self.config.name, e);
                        Event::TcpClosed
                    }
                    None => Event::TcpClosed,
                },
            };
            self.handle(event).await;
        }

        self.handle(Event::Stop).await;
        info!("Stopped BGP session to peer {}", self.config.name);
    }

    fn attach(&mut self, connection: Connection) -> Event {
        self.local_addr = Some(connection.local_addr);
        self.fsm_config.router_id = router_id(&self.config, connection.local_addr, &self.node_name);
        self.framed = Some(Framed::new(connection.stream, BgpCodec::new()));
        Event::TcpConnected
    }

    /// Runs `event` and any follow-up events through the FSM.
    async fn handle(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let before = self.state.kind();
            let (next, actions) = fsm::transition(&self.state, &self.fsm_config, event);
            self.state = next;
            let after = self.state.kind();
            if before != after {
                info!(
                    "BGP session to peer {}: {} -> {}",
                    self.config.name, before, after
                );
                self.status.since = Utc::now();
            }
            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push_back(follow_up);
                }
            }
            if before != after {
                self.publish();
            }
        }
    }

    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::Connect => {
                self.status.connect_attempts += 1;
                let dialer = Arc::clone(&self.dialer);
                let peer = self.config.clone();
                self.connecting = Some(Box::pin(async move { dialer.dial(&peer).await }));
                None
            }
            Action::SendOpen(open) => self.send(Message::Open(open)).await,
            Action::SendKeepalive => self.send(Message::Keepalive).await,
            Action::SendNotification(notification) => {
                warn!("Sending NOTIFICATION to BGP peer {}: {}", self.config.name, notification);
                // The connection is closed right after; a failed write changes nothing.
                self.send(Message::Notification(notification)).await;
                None
            }
            Action::StartHoldTimer(duration) => {
                self.hold_at = Some(Instant::now() + duration);
                None
            }
            Action::StartKeepaliveTimer(duration) => {
                self.keepalive_at = Some(Instant::now() + duration);
                None
            }
            Action::StopTimers => {
                self.hold_at = None;
                self.keepalive_at = None;
                None
            }
            Action::CloseConnection => {
                self.connecting = None;
                self.local_addr = None;
                if let Some(mut framed) = self.framed.take() {
                    if let Ok(Err(e)) = timeout(WRITE_TIMEOUT, framed.close()).await {
                        debug!("Closing connection to BGP peer {}: {}", self.config.name, e);
                    }
                }
                None
            }
            Action::ScheduleReconnect => {
                let delay = self.backoff.next_backoff();
                debug!("Reconnecting to BGP peer {} in {:?}", self.config.name, delay);
                self.reconnect_at = Some(Instant::now() + delay);
                None
            }
            Action::Established(negotiated) => {
                self.backoff.reset();
                if let Some(framed) = self.framed.as_mut() {
                    framed.codec_mut().set_four_octet_as(negotiated.four_octet_as);
                }
                self.advertised.clear();
                self.status.last_error = None;
                self.status.negotiated_hold_time = Some(negotiated.hold_time);
                info!(
                    "BGP session to peer {} established (hold time {}s, router id {})",
                    self.config.name, negotiated.hold_time, negotiated.peer_router_id
                );
                self.sync_routes().await
            }
            Action::SessionDown(reason) => {
                if self.advertised.is_empty() {
                    debug!("BGP session to peer {} down: {}", self.config.name, reason);
                } else {
                    warn!(
                        "BGP session to peer {} down, {} advertised prefixes withdrawn: {}",
                        self.config.name,
                        self.advertised.len(),
                        reason
                    );
                }
                self.advertised.clear();
                self.status.advertised_prefixes = 0;
                self.status.negotiated_hold_time = None;
                self.status.last_error = Some(reason);
                self.publish();
                None
            }
        }
    }

    /// Writes one message; a failed write drops the connection.
    async fn send(&mut self, message: Message) -> Option<Event> {
        let framed = self.framed.as_mut()?;
        let kind = message.name();
        match timeout(WRITE_TIMEOUT, framed.send(message)).await {
            Ok(Ok(())) => None,
            Ok(Err(CodecError::Encode(e))) => {
                error!("Cannot encode {} for BGP peer {}: {}", kind, self.config.name, e);
                None
            }
            Ok(Err(e)) => {
                warn!("Writing {} to BGP peer {} failed: {}", kind, self.config.name, e);
                self.framed = None;
                Some(Event::TcpClosed)
            }
            Err(_elapsed) => {
                warn!("Writing {} to BGP peer {} timed out", kind, self.config.name);
                self.framed = None;
                Some(Event::TcpClosed)
            }
        }
    }

    async fn apply(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Diff { withdraw, advertise } => {
                for prefix in withdraw {
                    self.desired.remove(&prefix);
                }
                for route in advertise {
                    self.desired.insert(route.prefix, route);
                }
            }
            SessionCommand::Replace(routes) => {
                self.desired = routes.into_iter().map(|r| (r.prefix, r)).collect();
            }
        }
        if let Some(event) = self.sync_routes().await {
            self.handle(event).await;
        }
    }

    /// Whether `route` can go out on this connection.
    fn sendable(negotiated: &fsm::Negotiated, local: IpAddr, route: &Route) -> bool {
        let family = route.family();
        let local_family = match local {
            IpAddr::V4(_) => AddressFamily::Ipv4Unicast,
            IpAddr::V6(_) => AddressFamily::Ipv6Unicast,
        };
        family == local_family && negotiated.supports(family)
    }

    /// Brings the peer's table in line with `desired`. No-op unless Established.
    async fn sync_routes(&mut self) -> Option<Event> {
        let State::Established(negotiated) = self.state else {
            return None;
        };
        let local = self.local_addr?;

        let target: BTreeMap<IpNet, &Route> = self
            .desired
            .iter()
            .filter(|(_, route)| Self::sendable(&negotiated, local, route))
            .map(|(prefix, route)| (*prefix, route))
            .collect();
        let withdraw: Vec<IpNet> = self
            .advertised
            .keys()
            .filter(|prefix| !target.contains_key(prefix))
            .copied()
            .collect();
        let advertise: Vec<Route> = target
            .values()
            .filter(|route| self.advertised.get(&route.prefix) != Some(**route))
            .map(|route| (*route).clone())
            .collect();
        if withdraw.is_empty() && advertise.is_empty() {
            return None;
        }

        let ctx = PathContext {
            local_asn: self.config.local_asn,
            ibgp: self.config.is_ibgp(),
            four_octet_as: negotiated.four_octet_as,
            next_hop: local,
        };
        debug!(
            "Sending {} withdrawals and {} announcements to BGP peer {}",
            withdraw.len(),
            advertise.len(),
            self.config.name
        );
        for update in route::build_updates(&ctx, &withdraw, &advertise) {
            if let Some(event) = self.send(Message::Update(update)).await {
                return Some(event);
            }
            self.status.updates_sent += 1;
        }

        for prefix in &withdraw {
            self.advertised.remove(prefix);
        }
        for route in advertise {
            self.advertised.insert(route.prefix, route);
        }
        self.status.advertised_prefixes = self.advertised.len();
        self.publish();
        None
    }

    fn publish(&mut self) {
        self.status.state = self.state.kind();
        self.status_tx.send_replace(self.status.clone());
        if let Some(callback) = &self.callback {
            callback(&self.status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_id_precedence() {
        let mut peer = PeerConfig::new("tor", 64512, 64513, "10.0.0.254".parse().unwrap());
        let local: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(router_id(&peer, local, "node-a"), Ipv4Addr::new(10, 0, 0, 5));

        let v6: IpAddr = "2001:db8::5".parse().unwrap();
        let hashed = router_id(&peer, v6, "node-a");
        assert!(!hashed.is_unspecified());
        assert_eq!(hashed, router_id(&peer, v6, "node-a"));
        assert_ne!(hashed, router_id(&peer, v6, "node-b"));

        peer.router_id = Some(Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(router_id(&peer, local, "node-a"), Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn test_sendable_requires_matching_family() {
        let negotiated = fsm::Negotiated {
            hold_time: 90,
            four_octet_as: true,
            ipv4_unicast: true,
            ipv6_unicast: false,
            peer_router_id: Ipv4Addr::new(10, 0, 0, 2),
            peer_asn: 64513,
        };
        let v4 = Route::new("10.0.0.1/32".parse().unwrap());
        let v6 = Route::new("2001:db8::1/128".parse().unwrap());
        let local: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(Session::sendable(&negotiated, local, &v4));
        assert!(!Session::sendable(&negotiated, local, &v6));
        let local6: IpAddr = "2001:db8::5".parse().unwrap();
        assert!(!Session::sendable(&negotiated, local6, &v4));
    }
}
