//! Manifest watcher.
//!
//! Re-reads the manifest on a fixed interval and hands a fresh [`Snapshot`]
//! to the reconcile loop whenever the file content changed. The first
//! successful read is always handed over.

use crate::error::ControllerError;
use crate::snapshot::Snapshot;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Polls one manifest file.
#[derive(Debug)]
pub struct ManifestWatcher {
    path: PathBuf,
    interval: Duration,
    snapshots: mpsc::Sender<Snapshot>,
    /// Content of the last read, parsed or not
    last: Option<String>,
}

impl ManifestWatcher {
    /// A watcher sending snapshots of `path` to `snapshots`.
    pub fn new(path: PathBuf, interval: Duration, snapshots: mpsc::Sender<Snapshot>) -> Self {
        Self {
            path,
            interval,
            snapshots,
            last: None,
        }
    }

    /// Polls until the receiving side goes away.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Watching manifest {} every {:?}", self.path.display(), self.interval);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(snapshot) = self.poll().await {
                if self.snapshots.send(snapshot).await.is_err() {
                    return Err(ControllerError::Task("reconcile loop stopped accepting snapshots".to_string()));
                }
            }
        }
    }

    /// Reads the manifest; a snapshot only if the content changed and parses.
    async fn poll(&mut self) -> Option<Snapshot> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read manifest {}: {}", self.path.display(), e);
                return None;
            }
        };
        if self.last.as_deref() == Some(text.as_str()) {
            debug!("Manifest {} unchanged", self.path.display());
            return None;
        }
        let parsed = Snapshot::parse(&text);
        self.last = Some(text);
        match parsed {
            Ok(snapshot) => {
                info!(
                    "Manifest {} changed: {} pools, {} peers, {} services",
                    self.path.display(),
                    snapshot.pools.len(),
                    snapshot.peers.len(),
                    snapshot.services.len()
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!("Ignoring manifest {}: {}", self.path.display(), e);
                None
            }
        }
    }
}
