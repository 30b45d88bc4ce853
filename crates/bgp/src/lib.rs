//! # BGP
//!
//! A small BGP-4 speaker that only originates routes: it dials each
//! configured peer, brings the session up, and advertises host (or
//! aggregated) routes for allocated service addresses.
//!
//! ## Layers
//!
//! - [`message`] and [`codec`]: bit-exact wire format and stream framing
//! - [`fsm`]: the session state machine as a pure transition function
//! - [`session`]: the per-peer task driving the FSM over a connection
//! - [`speaker`]: one session per peer, route diffing and fan-out
//!
//! ## Example
//!
//! ```no_run
//! use bgp::{PeerConfig, Route, Speaker, TcpDialer};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let mut speaker = Speaker::new("node-a", BTreeMap::new(), Arc::new(TcpDialer::default()));
//! let peer = PeerConfig::new("tor", 64512, 64513, "10.0.0.254".parse().unwrap());
//! speaker.set_config(vec![peer]).await;
//! speaker.set_routes(vec![Route::new("192.168.10.1/32".parse().unwrap())]);
//! # }
//! ```

pub mod backoff;
pub mod codec;
pub mod dial;
pub mod error;
pub mod fsm;
pub mod md5;
pub mod message;
pub mod peer;
pub mod route;
pub mod session;
pub mod speaker;

#[cfg(feature = "test-util")]
pub mod mock;

pub use codec::BgpCodec;
pub use dial::{Connection, Dialer, TcpDialer, Transport};
pub use error::{CodecError, DecodeError, EncodeError};
pub use fsm::{Negotiated, SessionState};
pub use message::{Message, Notification, Open, Update};
pub use peer::PeerConfig;
pub use route::Route;
pub use session::{SessionCommand, SessionHandle, SessionStatus, StatusCallback};
pub use speaker::{PeerStatus, Speaker};
