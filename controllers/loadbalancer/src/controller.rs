//! Main controller implementation.
//!
//! Runs three tasks: the manifest watcher, the status server and the
//! reconcile loop. The reconcile loop owns the [`Reconciler`] and with it the
//! allocator and the BGP speaker.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::{Layer2Event, Reconciler};
use crate::snapshot::Snapshot;
use crate::status::{self, StatusBoard};
use crate::watcher::ManifestWatcher;
use bgp::{Speaker, TcpDialer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{error, info};

const SNAPSHOT_QUEUE: usize = 4;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Main controller for LoadBalancer address management.
#[derive(Debug)]
pub struct Controller {
    watcher: JoinHandle<Result<(), ControllerError>>,
    status_server: JoinHandle<Result<(), ControllerError>>,
    reconcile_loop: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl Controller {
    /// Starts every task. Must be called inside a tokio runtime.
    pub fn new(config: ControllerConfig) -> Self {
        info!("Initializing LoadBalancer Controller for node {}", config.node_name);

        let board = StatusBoard::new();
        let speaker = Speaker::new(
            config.node_name.clone(),
            config.node_labels.clone(),
            Arc::new(TcpDialer::default()),
        )
        .with_status_callback(board.session_callback());
        let reconciler =
            Reconciler::new(speaker, board.clone()).with_node(config.node_name.clone(), config.node_labels.clone());

        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_QUEUE);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let watcher = tokio::spawn(
            ManifestWatcher::new(config.manifest_path.clone(), config.resync_interval, snapshot_tx).run(),
        );
        let status_server = tokio::spawn(status::serve(config.status_addr, board));
        let reconcile_loop = tokio::spawn(reconcile_loop(
            reconciler,
            snapshot_rx,
            config.resync_interval,
            shutdown_rx,
        ));

        Self {
            watcher,
            status_server,
            reconcile_loop,
            shutdown,
        }
    }

    /// Runs until a task exits or Ctrl-C, then tears the BGP sessions down.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("LoadBalancer Controller running");

        let mut loop_finished = false;
        let result = tokio::select! {
            result = &mut self.watcher => task_result("manifest watcher", result),
            result = &mut self.status_server => task_result("status server", result),
            result = &mut self.reconcile_loop => {
                loop_finished = true;
                match result {
                    Ok(()) => Err(ControllerError::Task("reconcile loop exited".to_string())),
                    Err(e) => Err(ControllerError::Task(format!("reconcile loop panicked: {e}"))),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        info!("Received Ctrl-C, shutting down");
                        Ok(())
                    }
                    Err(e) => Err(ControllerError::Task(format!("failed to listen for Ctrl-C: {e}"))),
                }
            }
        };

        if let Err(e) = &result {
            error!("Controller stopping: {}", e);
        }

        self.watcher.abort();
        self.status_server.abort();
        if !loop_finished {
            // The loop also stops by itself once the watcher drops its sender.
            let _ = self.shutdown.send(());
            if timeout(SHUTDOWN_TIMEOUT, &mut self.reconcile_loop).await.is_err() {
                error!("BGP sessions did not shut down within {:?}", SHUTDOWN_TIMEOUT);
                self.reconcile_loop.abort();
            }
        }
        info!("LoadBalancer Controller stopped");
        result
    }
}

fn task_result(
    name: &str,
    result: Result<Result<(), ControllerError>, JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => Err(ControllerError::Task(format!("{name} exited"))),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(ControllerError::Task(format!("{name} panicked: {e}"))),
    }
}

/// Applies snapshots as they arrive and retries pending route updates on
/// every tick.
async fn reconcile_loop(
    mut reconciler: Reconciler,
    mut snapshots: mpsc::Receiver<Snapshot>,
    resync: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = interval(resync);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else { break };
                for event in reconciler.reconcile(&snapshot).await {
                    match event {
                        Layer2Event::Added(ip) => info!("Layer2: announcing {}", ip),
                        Layer2Event::Removed(ip) => info!("Layer2: withdrawing {}", ip),
                    }
                }
                info!(
                    "Reconciled: {} services with addresses, {} routes",
                    reconciler.allocator().allocations().len(),
                    reconciler.routes().len()
                );
            }
            _ = ticker.tick() => reconciler.flush_pending(),
        }
    }
    reconciler.shutdown().await;
}
