//! # Session state machine
//!
//! The BGP finite state machine as a pure function. [`transition`] maps the
//! current [`State`] and an [`Event`] to the next state plus the [`Action`]s
//! the driver in [`crate::session`] must carry out, in order. Nothing here
//! touches a socket or a clock.
//!
//! Only outbound connections are made, so there is no `Active` state.

use crate::error::DecodeError;
use crate::message::notification::CEASE_ADMINISTRATIVE_SHUTDOWN;
use crate::message::{AddressFamily, Message, Notification, Open};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Hold timer while waiting for the peer's OPEN (RFC 4271 §8.2.2 suggests 4 minutes).
pub const OPEN_SENT_HOLD_TIME: Duration = Duration::from_secs(240);

/// Largest 2-octet AS number.
const MAX_TWO_OCTET_AS: u32 = 65535;

/// Parameters agreed with the peer once its OPEN is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Negotiated {
    /// min(local, remote) hold time in seconds; 0 disables keepalives
    pub hold_time: u16,
    /// Both sides advertised the 4-octet AS capability
    pub four_octet_as: bool,
    /// IPv4 unicast routes may be exchanged
    pub ipv4_unicast: bool,
    /// IPv6 unicast routes may be exchanged
    pub ipv6_unicast: bool,
    /// Peer's BGP identifier
    pub peer_router_id: Ipv4Addr,
    /// Peer's AS number
    pub peer_asn: u32,
}

impl Negotiated {
    /// Hold timer duration, `None` when disabled.
    #[must_use]
    pub fn hold_duration(&self) -> Option<Duration> {
        (self.hold_time > 0).then(|| Duration::from_secs(u64::from(self.hold_time)))
    }

    /// Keepalive interval (hold time / 3), `None` when disabled.
    #[must_use]
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.hold_duration().map(|hold| hold / 3)
    }

    /// Whether routes of `family` may be sent.
    #[must_use]
    pub fn supports(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::Ipv4Unicast => self.ipv4_unicast,
            AddressFamily::Ipv6Unicast => self.ipv6_unicast,
        }
    }
}

/// FSM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// No connection; waiting for start or the reconnect backoff
    #[default]
    Idle,
    /// TCP connection in progress
    Connect,
    /// OPEN sent, waiting for the peer's OPEN
    OpenSent,
    /// OPENs exchanged, waiting for the peer's KEEPALIVE
    OpenConfirm(Negotiated),
    /// Session up
    Established(Negotiated),
}

impl State {
    /// The state without its negotiated parameters.
    #[must_use]
    pub fn kind(&self) -> SessionState {
        match self {
            State::Idle => SessionState::Idle,
            State::Connect => SessionState::Connect,
            State::OpenSent => SessionState::OpenSent,
            State::OpenConfirm(_) => SessionState::OpenConfirm,
            State::Established(_) => SessionState::Established,
        }
    }

    /// Negotiated parameters, once OPENs have been exchanged.
    #[must_use]
    pub fn negotiated(&self) -> Option<&Negotiated> {
        match self {
            State::OpenConfirm(n) | State::Established(n) => Some(n),
            _ => None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self, State::OpenSent | State::OpenConfirm(_) | State::Established(_))
    }
}

/// State names as reported in status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Idle
    Idle,
    /// Connect
    Connect,
    /// OpenSent
    OpenSent,
    /// OpenConfirm
    OpenConfirm,
    /// Established
    Established,
}

impl SessionState {
    /// Name used in logs and FSM error reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local parameters the FSM needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsmConfig {
    /// Local AS
    pub local_asn: u32,
    /// Expected peer AS
    pub peer_asn: u32,
    /// Proposed hold time in seconds
    pub hold_time: u16,
    /// Local BGP identifier
    pub router_id: Ipv4Addr,
    /// Families announced in the multiprotocol capability
    pub families: Vec<AddressFamily>,
}

/// Inputs to the FSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Start the session, or retry after the backoff elapsed
    Start,
    /// Administrative stop
    Stop,
    /// Outbound TCP connection established
    TcpConnected,
    /// Outbound TCP connection failed
    TcpFailed(String),
    /// Connection closed or reset by the peer
    TcpClosed,
    /// A message was decoded
    MessageReceived(Message),
    /// Bytes from the peer could not be decoded
    DecodeFailed(DecodeError),
    /// Hold timer fired
    HoldTimerExpired,
    /// Keepalive timer fired
    KeepaliveTimerExpired,
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the TCP connection
    Connect,
    /// Send our OPEN
    SendOpen(Open),
    /// Send a KEEPALIVE
    SendKeepalive,
    /// Send a NOTIFICATION
    SendNotification(Notification),
    /// (Re)arm the hold timer
    StartHoldTimer(Duration),
    /// (Re)arm the keepalive timer
    StartKeepaliveTimer(Duration),
    /// Disarm hold and keepalive timers
    StopTimers,
    /// Close the TCP connection
    CloseConnection,
    /// Arm the reconnect backoff
    ScheduleReconnect,
    /// Session reached Established; send the full route table
    Established(Negotiated),
    /// Session left a connected state; advertised routes are gone
    SessionDown(String),
}

/// Computes the next state and the actions to perform.
#[must_use]
pub fn transition(state: &State, config: &FsmConfig, event: Event) -> (State, Vec<Action>) {
    match (state, event) {
        (State::Idle, Event::Start) => (State::Connect, vec![Action::Connect]),

        (_, Event::Stop) => {
            let mut actions = Vec::new();
            if state.is_connected() {
                actions.push(Action::SendNotification(Notification::cease(
                    CEASE_ADMINISTRATIVE_SHUTDOWN,
                )));
            }
            actions.extend([
                Action::StopTimers,
                Action::CloseConnection,
                Action::SessionDown("administratively stopped".to_string()),
            ]);
            (State::Idle, actions)
        }

        (State::Connect, Event::TcpConnected) => (
            State::OpenSent,
            vec![
                Action::SendOpen(Open::new(
                    config.local_asn,
                    config.hold_time,
                    config.router_id,
                    &config.families,
                )),
                Action::StartHoldTimer(OPEN_SENT_HOLD_TIME),
            ],
        ),

        (State::Connect, Event::TcpFailed(reason)) => {
            (State::Idle, vec![Action::SessionDown(reason), Action::ScheduleReconnect])
        }

        (s, Event::TcpClosed) if s.is_connected() || *s == State::Connect => {
            drop_to_idle(None, "connection closed by peer".to_string())
        }

        (s, Event::HoldTimerExpired) if s.is_connected() => {
            drop_to_idle(Some(Notification::hold_timer_expired()), "hold timer expired".to_string())
        }

        (s, Event::DecodeFailed(err)) if s.is_connected() => {
            drop_to_idle(Some(err.notification()), err.to_string())
        }

        (State::OpenConfirm(n) | State::Established(n), Event::KeepaliveTimerExpired) => {
            let mut actions = vec![Action::SendKeepalive];
            if let Some(interval) = n.keepalive_interval() {
                actions.push(Action::StartKeepaliveTimer(interval));
            }
            (*state, actions)
        }

        (s, Event::MessageReceived(message)) if s.is_connected() => receive(s, config, message),

        // Anything else is stale (a timer or connection result that raced a
        // state change) and is dropped.
        (s, _) => (*s, Vec::new()),
    }
}

fn receive(state: &State, config: &FsmConfig, message: Message) -> (State, Vec<Action>) {
    match (state, message) {
        (_, Message::Notification(n)) => {
            let mut actions = vec![Action::StopTimers, Action::CloseConnection];
            actions.push(Action::SessionDown(format!("peer sent NOTIFICATION: {n}")));
            actions.push(Action::ScheduleReconnect);
            (State::Idle, actions)
        }

        (State::OpenSent, Message::Open(open)) => match validate_open(config, &open) {
            Ok(negotiated) => {
                let mut actions = vec![Action::SendKeepalive];
                actions.extend(arm_timers(&negotiated));
                (State::OpenConfirm(negotiated), actions)
            }
            Err(err) => drop_to_idle(Some(err.notification()), err.to_string()),
        },

        (State::OpenConfirm(n), Message::Keepalive) => {
            let mut actions = vec![Action::Established(*n)];
            actions.extend(restart_hold(n));
            (State::Established(*n), actions)
        }

        (State::Established(n), Message::Keepalive | Message::Update(_)) => {
            (State::Established(*n), restart_hold(n))
        }

        (s, message) => {
            let err = DecodeError::UnexpectedMessage {
                message: message.name(),
                state: s.kind().as_str(),
            };
            drop_to_idle(Some(err.notification()), err.to_string())
        }
    }
}

fn restart_hold(n: &Negotiated) -> Vec<Action> {
    n.hold_duration().map(Action::StartHoldTimer).into_iter().collect()
}

fn arm_timers(n: &Negotiated) -> Vec<Action> {
    match (n.hold_duration(), n.keepalive_interval()) {
        (Some(hold), Some(keepalive)) => {
            vec![Action::StartHoldTimer(hold), Action::StartKeepaliveTimer(keepalive)]
        }
        _ => vec![Action::StopTimers],
    }
}

fn drop_to_idle(notification: Option<Notification>, reason: String) -> (State, Vec<Action>) {
    let mut actions = Vec::with_capacity(5);
    if let Some(n) = notification {
        actions.push(Action::SendNotification(n));
    }
    actions.extend([
        Action::StopTimers,
        Action::CloseConnection,
        Action::SessionDown(reason),
        Action::ScheduleReconnect,
    ]);
    (State::Idle, actions)
}

/// Checks the peer's OPEN against the local configuration.
///
/// Hold time is checked first, then the identifier, the AS number and
/// finally 4-octet AS support.
pub fn validate_open(config: &FsmConfig, open: &Open) -> Result<Negotiated, DecodeError> {
    if matches!(open.hold_time, 1 | 2) {
        return Err(DecodeError::UnacceptableHoldTime(open.hold_time));
    }
    if open.router_id.is_unspecified() {
        return Err(DecodeError::BadBgpIdentifier);
    }
    let peer_asn = open.asn();
    if peer_asn != config.peer_asn {
        return Err(DecodeError::BadPeerAs(peer_asn));
    }
    let four_octet_as = open.supports_four_octet_as();
    if config.local_asn > MAX_TWO_OCTET_AS && !four_octet_as {
        return Err(DecodeError::UnsupportedCapability(format!(
            "peer lacks 4-octet AS support required by local AS {}",
            config.local_asn
        )));
    }

    let offered = |family| config.families.contains(&family) && open.supports_family(family);
    Ok(Negotiated {
        hold_time: config.hold_time.min(open.hold_time),
        four_octet_as,
        ipv4_unicast: offered(AddressFamily::Ipv4Unicast),
        ipv6_unicast: offered(AddressFamily::Ipv6Unicast),
        peer_router_id: open.router_id,
        peer_asn,
    })
}
