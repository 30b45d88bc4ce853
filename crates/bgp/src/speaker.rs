//! # BGP Speaker
//!
//! Owns one session per configured peer that applies to the local node and
//! keeps each session's desired table equal to the routes implied by the
//! current allocations.
//!
//! Diffing happens here; advertising happens in the session tasks. The
//! speaker remembers what it last enqueued per peer and sends only the
//! difference. When a queue is full the peer is marked for a resync and gets
//! the complete table on the next call instead.

use crate::dial::Dialer;
use crate::peer::PeerConfig;
use crate::route::Route;
use crate::session::{self, SessionCommand, SessionHandle, SessionStatus, StatusCallback};
use futures::future::join_all;
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// A running session and what the speaker last told it.
struct PeerSession {
    config: PeerConfig,
    handle: SessionHandle,
    /// Table the session holds once every enqueued command is applied
    enqueued: BTreeMap<IpNet, Route>,
    /// The next update must be a full `Replace`
    needs_resync: bool,
}

/// Status of one peer for reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    /// Peer configuration, password redacted
    pub config: PeerConfig,
    /// Session status
    pub session: SessionStatus,
}

/// The BGP speaker for one node.
pub struct Speaker {
    node_name: String,
    labels: BTreeMap<String, String>,
    dialer: Arc<dyn Dialer>,
    callback: Option<StatusCallback>,
    /// Peers as configured, before node selection
    configured: Vec<PeerConfig>,
    sessions: BTreeMap<String, PeerSession>,
    /// Current routes, one per prefix
    routes: Vec<Route>,
}

impl fmt::Debug for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Speaker")
            .field("node_name", &self.node_name)
            .field("labels", &self.labels)
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl Speaker {
    /// A speaker for node `node_name` with no peers and no routes.
    #[must_use]
    pub fn new(
        node_name: impl Into<String>,
        labels: BTreeMap<String, String>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            labels,
            dialer,
            callback: None,
            configured: Vec::new(),
            sessions: BTreeMap::new(),
            routes: Vec::new(),
        }
    }

    /// Sets the callback every session reports status changes to.
    ///
    /// Applies to sessions started afterwards.
    #[must_use]
    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Replaces the peer configuration.
    ///
    /// Removed peers are torn down, new peers started, and peers whose
    /// configuration changed are torn down and started again.
    pub async fn set_config(&mut self, peers: Vec<PeerConfig>) {
        self.configured = peers;
        self.reconcile_sessions().await;
    }

    /// Updates the local node's labels and re-evaluates node selectors.
    pub async fn set_node_labels(&mut self, labels: BTreeMap<String, String>) {
        if labels == self.labels {
            return;
        }
        self.labels = labels;
        self.reconcile_sessions().await;
    }

    /// Replaces the set of routes to advertise.
    ///
    /// Several routes for one prefix are merged. Each session receives the
    /// difference against what it was last sent.
    pub fn set_routes(&mut self, routes: Vec<Route>) {
        self.routes = merge_routes(routes);
        for (name, peer) in &mut self.sessions {
            sync_peer(name, peer, &self.routes);
        }
    }

    /// Retries full resyncs for peers whose queue was full.
    pub fn flush_pending(&mut self) {
        for (name, peer) in &mut self.sessions {
            if peer.needs_resync {
                sync_peer(name, peer, &self.routes);
            }
        }
    }

    /// Current routes after merging.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Per-peer status, in peer name order.
    #[must_use]
    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.sessions
            .values()
            .map(|peer| PeerStatus {
                config: peer.config.redacted(),
                session: peer.handle.status(),
            })
            .collect()
    }

    /// Tears down every session.
    pub async fn shutdown(&mut self) {
        let sessions = std::mem::take(&mut self.sessions);
        info!("Shutting down {} BGP sessions", sessions.len());
        join_all(sessions.into_values().map(|peer| peer.handle.shutdown())).await;
    }

    /// Peers that apply to this node, keyed by name.
    fn wanted_peers(&self) -> BTreeMap<String, PeerConfig> {
        let mut wanted = BTreeMap::new();
        let mut endpoints = HashSet::new();
        for peer in &self.configured {
            if !peer.selects(&self.labels) {
                debug!("Peer {} does not select node {}", peer.name, self.node_name);
                continue;
            }
            if wanted.contains_key(&peer.name) {
                warn!("Skipping duplicate peer name {}", peer.name);
                continue;
            }
            if !endpoints.insert(peer.endpoint()) {
                warn!(
                    "Skipping peer {}: another peer already connects to {}",
                    peer.name,
                    peer.endpoint()
                );
                continue;
            }
            wanted.insert(peer.name.clone(), peer.clone());
        }
        wanted
    }

    async fn reconcile_sessions(&mut self) {
        let wanted = self.wanted_peers();

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(name, peer)| wanted.get(*name) != Some(&peer.config))
            .map(|(name, _)| name.clone())
            .collect();
        let mut stopping = Vec::with_capacity(stale.len());
        for name in stale {
            if let Some(peer) = self.sessions.remove(&name) {
                if wanted.contains_key(&name) {
                    info!("Configuration of BGP peer {} changed, restarting its session", name);
                } else {
                    info!("BGP peer {} removed, stopping its session", name);
                }
                stopping.push(peer.handle.shutdown());
            }
        }
        join_all(stopping).await;

        for (name, config) in wanted {
            if self.sessions.contains_key(&name) {
                continue;
            }
            let handle = session::spawn(
                config.clone(),
                &self.node_name,
                Arc::clone(&self.dialer),
                self.callback.clone(),
            );
            let mut peer = PeerSession {
                config,
                handle,
                enqueued: BTreeMap::new(),
                needs_resync: true,
            };
            sync_peer(&name, &mut peer, &self.routes);
            self.sessions.insert(name, peer);
        }
    }
}

/// One route per prefix, in prefix order.
fn merge_routes(routes: Vec<Route>) -> Vec<Route> {
    let mut merged: BTreeMap<IpNet, Route> = BTreeMap::new();
    for route in routes {
        match merged.get_mut(&route.prefix) {
            Some(existing) => existing.merge(&route),
            None => {
                merged.insert(route.prefix, route);
            }
        }
    }
    merged.into_values().collect()
}

/// Enqueues whatever `peer` needs to match `routes`.
fn sync_peer(name: &str, peer: &mut PeerSession, routes: &[Route]) {
    let desired: BTreeMap<IpNet, Route> = routes
        .iter()
        .filter(|route| route.applies_to(name))
        .map(|route| (route.prefix, route.clone()))
        .collect();

    let command = if peer.needs_resync {
        SessionCommand::Replace(desired.values().cloned().collect())
    } else {
        let withdraw: Vec<IpNet> = peer
            .enqueued
            .keys()
            .filter(|prefix| !desired.contains_key(prefix))
            .copied()
            .collect();
        let advertise: Vec<Route> = desired
            .values()
            .filter(|route| peer.enqueued.get(&route.prefix) != Some(*route))
            .cloned()
            .collect();
        if withdraw.is_empty() && advertise.is_empty() {
            return;
        }
        SessionCommand::Diff { withdraw, advertise }
    };

    match peer.handle.try_send(command) {
        Ok(()) => {
            peer.enqueued = desired;
            peer.needs_resync = false;
        }
        Err(TrySendError::Full(_)) => {
            warn!("Command queue for BGP peer {} is full, scheduling a full resync", name);
            peer.needs_resync = true;
        }
        Err(TrySendError::Closed(_)) => {
            warn!("BGP session task for peer {} has exited", name);
            peer.needs_resync = true;
        }
    }
}
