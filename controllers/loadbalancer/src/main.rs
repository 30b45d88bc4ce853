//! LoadBalancer Controller
//!
//! Gives bare-metal clusters LoadBalancer services: assigns each service a
//! stable address from the configured pools and announces it over BGP (or
//! reports it for layer 2 announcement).
//!
//! Pools, advertisements, peers and services are read from a manifest file
//! that is re-read periodically.

mod config;
mod controller;
mod error;
mod reconciler;
mod snapshot;
mod status;
mod watcher;

#[cfg(test)]
mod reconciler_test;

use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting LoadBalancer Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Manifest: {}", config.manifest_path.display());
    info!("  Node: {}", config.node_name);
    info!("  Node labels: {:?}", config.node_labels);
    info!("  Status endpoint: {}", config.status_addr);
    info!("  Resync interval: {:?}", config.resync_interval);

    Controller::new(config).run().await
}
