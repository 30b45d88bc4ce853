//! Controller configuration from environment variables.

use crate::error::ControllerError;
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_STATUS_ADDR: &str = "0.0.0.0:7472";
const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 10;

/// Settings read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Multi-document YAML holding pools, advertisements, peers and services
    pub manifest_path: PathBuf,
    /// Name of the node this speaker runs on
    pub node_name: String,
    /// Labels of this node, matched against peer node selectors
    pub node_labels: BTreeMap<String, String>,
    /// Listen address of the status endpoint
    pub status_addr: SocketAddr,
    /// How often the manifest is re-read
    pub resync_interval: Duration,
}

impl ControllerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).filter(|v| !v.trim().is_empty()).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("{key} environment variable is required"))
            })
        };

        let manifest_path = PathBuf::from(required("MANIFEST_PATH")?);
        let node_name = required("NODE_NAME")?;
        let node_labels = parse_labels(&lookup("NODE_LABELS").unwrap_or_default())?;

        let status_addr = lookup("STATUS_ADDR")
            .unwrap_or_else(|| DEFAULT_STATUS_ADDR.to_string())
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("STATUS_ADDR: {e}")))?;

        let resync_secs = match lookup("RESYNC_INTERVAL_SECS") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(format!(
                        "RESYNC_INTERVAL_SECS must be a positive integer, got {value:?}"
                    ))
                })?,
            None => DEFAULT_RESYNC_INTERVAL_SECS,
        };

        Ok(Self {
            manifest_path,
            node_name,
            node_labels,
            status_addr,
            resync_interval: Duration::from_secs(resync_secs),
        })
    }
}

/// Parses `k=v,k=v`. Empty input is an empty map.
fn parse_labels(text: &str) -> Result<BTreeMap<String, String>, ControllerError> {
    text.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ControllerError::InvalidConfig(format!("NODE_LABELS: expected key=value, got {pair:?}"))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ControllerError::InvalidConfig(format!(
                    "NODE_LABELS: empty key in {pair:?}"
                )));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
