//! Status endpoint.
//!
//! Serves `GET /healthz` and `GET /status`. The reconciler publishes a
//! [`StatusReport`] after every pass; sessions report their own state
//! through the speaker's status callback as it changes.

use crate::error::ControllerError;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use bgp::{PeerConfig, SessionStatus, StatusCallback};
use chrono::{DateTime, Utc};
use crds::IPAddressPoolStatus;
use ipam::{AllocatedAddress, Protocol};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Addresses held by one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    /// `namespace/name`
    pub service: String,
    /// Addresses and their pools
    pub addresses: Vec<AllocatedAddress>,
}

/// Usage of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolReport {
    /// Pool name
    pub name: String,
    /// How the pool is announced
    pub protocol: Protocol,
    /// Assigned and available addresses
    #[serde(flatten)]
    pub usage: IPAddressPoolStatus,
    /// Services holding an address of the pool
    pub services: u64,
}

/// Outcome of the latest reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// When the pass finished
    pub generated_at: Option<DateTime<Utc>>,
    /// Why the latest configuration was rejected, if it was
    pub config_error: Option<String>,
    /// Services with addresses, in service order
    pub assignments: Vec<Assignment>,
    /// Services without addresses and why, keyed by `namespace/name`
    pub failures: BTreeMap<String, String>,
    /// Pools in declaration order
    pub pools: Vec<PoolReport>,
    /// Addresses announced on layer 2
    pub layer2_addresses: Vec<IpAddr>,
    /// Active peers, passwords redacted
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    report: StatusReport,
    sessions: Vec<SessionStatus>,
}

/// Shared state behind the status endpoint.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    report: Arc<watch::Sender<StatusReport>>,
    sessions: Arc<watch::Sender<BTreeMap<String, SessionStatus>>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    /// An empty board.
    #[must_use]
    pub fn new() -> Self {
        Self {
            report: Arc::new(watch::Sender::new(StatusReport::default())),
            sessions: Arc::new(watch::Sender::new(BTreeMap::new())),
        }
    }

    /// Replaces the reconciliation report.
    pub fn publish(&self, report: StatusReport) {
        self.report.send_replace(report);
    }

    /// The latest reconciliation report.
    #[must_use]
    pub fn report(&self) -> StatusReport {
        self.report.borrow().clone()
    }

    /// Callback recording session status changes on this board.
    #[must_use]
    pub fn session_callback(&self) -> StatusCallback {
        let sessions = Arc::clone(&self.sessions);
        Arc::new(move |status: &SessionStatus| {
            sessions.send_modify(|all| {
                all.insert(status.peer.clone(), status.clone());
            });
        })
    }

    /// Forgets sessions of peers not in `peers`.
    pub fn retain_sessions(&self, peers: &BTreeSet<String>) {
        self.sessions.send_if_modified(|all| {
            let before = all.len();
            all.retain(|name, _| peers.contains(name));
            all.len() != before
        });
    }

    /// Current status of every known session, in peer order.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionStatus> {
        self.sessions.borrow().values().cloned().collect()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(board): State<StatusBoard>) -> Json<StatusView> {
    Json(StatusView {
        report: board.report(),
        sessions: board.sessions(),
    })
}

/// The status router.
pub fn router(board: StatusBoard) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(board)
}

/// Serves the status endpoint until the listener fails.
pub async fn serve(addr: SocketAddr, board: StatusBoard) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ControllerError::StatusBind { addr, source })?;
    info!("Status endpoint listening on http://{}", addr);
    axum::serve(listener, router(board))
        .await
        .map_err(ControllerError::StatusServe)
}
