//! Reconciliation of a snapshot into allocations, routes and layer 2
//! announcements.
//!
//! A pass runs in a fixed order:
//! 1. convert and validate pools and peers; a rejected configuration
//!    leaves the previous one in effect
//! 2. apply the pools, dropping allocations they no longer allow
//! 3. release services that disappeared
//! 4. replay services with recorded addresses, then allocate the rest
//! 5. derive BGP routes and layer 2 addresses
//! 6. push node labels, peers and routes to the speaker
//! 7. publish a status report

use crate::error::ConfigError;
use crate::snapshot::{ServiceEntry, Snapshot};
use crate::status::{Assignment, PoolReport, StatusBoard, StatusReport};
use bgp::{PeerConfig, Route, Speaker};
use chrono::Utc;
use crds::IPAddressPoolStatus;
use ipam::{AllocationError, AllocationRequest, Allocator, BgpAdvertisement, Pools, Protocol, ServiceId};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// A change in the set of addresses to answer ARP/NDP for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer2Event {
    /// Start announcing the address
    Added(IpAddr),
    /// Stop announcing the address
    Removed(IpAddr),
}

/// Owns the allocator and the speaker; the only writer of both.
#[derive(Debug)]
pub struct Reconciler {
    node_name: String,
    /// Labels from the environment; a `Node` in the snapshot overrides them
    node_labels: BTreeMap<String, String>,
    allocator: Allocator,
    speaker: Speaker,
    board: StatusBoard,
    peers: Vec<PeerConfig>,
    layer2: BTreeSet<IpAddr>,
}

impl Reconciler {
    /// A reconciler with no pools and no peers.
    #[must_use]
    pub fn new(speaker: Speaker, board: StatusBoard) -> Self {
        Self {
            node_name: String::new(),
            node_labels: BTreeMap::new(),
            allocator: Allocator::default(),
            speaker,
            board,
            peers: Vec::new(),
            layer2: BTreeSet::new(),
        }
    }

    /// Sets the local node, whose labels select BGP peers.
    #[must_use]
    pub fn with_node(mut self, name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        self.node_name = name.into();
        self.node_labels = labels;
        self
    }

    /// The allocator, for inspection.
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Routes currently handed to the speaker.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        self.speaker.routes()
    }

    /// Brings allocations, routes and announcements in line with `snapshot`.
    ///
    /// Returns the layer 2 changes the pass produced.
    pub async fn reconcile(&mut self, snapshot: &Snapshot) -> Vec<Layer2Event> {
        let mut report = StatusReport::default();

        match load_config(snapshot) {
            Ok((pools, peers)) => {
                for stale in self.allocator.set_pools(pools) {
                    info!(
                        "Released {:?} from {}: {} is no longer in any pool",
                        stale.allocation.ips(),
                        stale.allocation.service,
                        stale.ip
                    );
                }
                self.peers = peers;
            }
            Err(e) => {
                warn!("Rejected configuration, keeping the previous one: {}", e);
                report.config_error = Some(e.to_string());
            }
        }

        let (entries, invalid) = collect_services(snapshot);
        report.failures.extend(invalid.iter().map(|(id, e)| (id.to_string(), e.clone())));

        let present: BTreeSet<&ServiceId> = entries.keys().chain(invalid.keys()).collect();
        let gone: Vec<ServiceId> = self
            .allocator
            .allocations()
            .into_iter()
            .map(|allocation| allocation.service.clone())
            .filter(|id| !present.contains(id))
            .collect();
        for id in gone {
            if let Some(released) = self.allocator.unassign(&id) {
                info!("Service {} is gone, released {:?}", id, released.ips());
            }
        }

        let (replayed, fresh): (Vec<&ServiceEntry>, Vec<&ServiceEntry>) =
            entries.values().partition(|entry| !entry.recorded.is_empty());
        for entry in replayed.into_iter().chain(fresh) {
            match self.assign(entry) {
                Ok(ips) => debug!("Service {} has {:?}", entry.id, ips),
                Err(e) => {
                    warn!("Failed to allocate an address for {}: {}", entry.id, e);
                    report.failures.insert(entry.id.to_string(), e.to_string());
                }
            }
        }

        let (routes, layer2) = self.announcements();
        let events = self.layer2_events(layer2);

        self.speaker.set_node_labels(self.labels_for(snapshot)).await;
        self.speaker.set_config(self.peers.clone()).await;
        self.speaker.set_routes(routes);

        self.fill_report(&mut report);
        self.board.publish(report);
        events
    }

    /// Retries route updates that did not fit into a session queue.
    pub fn flush_pending(&mut self) {
        self.speaker.flush_pending();
    }

    /// Tears down every BGP session.
    pub async fn shutdown(&mut self) {
        self.speaker.shutdown().await;
    }

    /// Local node labels: configured ones overlaid with the snapshot's `Node`.
    fn labels_for(&self, snapshot: &Snapshot) -> BTreeMap<String, String> {
        let mut labels = self.node_labels.clone();
        if let Some(declared) = snapshot.node_labels(&self.node_name) {
            labels.extend(declared);
        }
        labels
    }

    /// Assigns addresses, preferring the ones recorded on the service.
    ///
    /// Recorded addresses are dropped when the service now asks for other
    /// addresses, or when the allocator refuses them (pool removed, pool
    /// annotation changed, sharing broken). Allocation is then retried from
    /// the service's own request.
    fn assign(&mut self, entry: &ServiceEntry) -> Result<Vec<IpAddr>, AllocationError> {
        if !entry.recorded.is_empty() {
            if !entry.request.addresses.is_empty() && !same_addresses(&entry.request.addresses, &entry.recorded) {
                info!(
                    "Service {} requests {:?} instead of recorded {:?}",
                    entry.id, entry.request.addresses, entry.recorded
                );
            } else {
                let replay = AllocationRequest {
                    addresses: entry.recorded.clone(),
                    ..entry.request.clone()
                };
                match self.allocator.assign(&entry.id, &replay) {
                    Ok(ips) => return Ok(ips),
                    Err(e) => info!(
                        "Recorded addresses {:?} of {} are no longer allowed ({}), allocating again",
                        entry.recorded, entry.id, e
                    ),
                }
            }
        }
        self.allocator.assign(&entry.id, &entry.request)
    }

    /// Routes for addresses of BGP pools and the addresses of layer 2 pools.
    fn announcements(&self) -> (Vec<Route>, BTreeSet<IpAddr>) {
        let mut routes = Vec::new();
        let mut layer2 = BTreeSet::new();
        for allocation in self.allocator.allocations() {
            for address in &allocation.addresses {
                let Some(pool) = self.allocator.pools().get(&address.pool) else {
                    continue;
                };
                match pool.protocol {
                    Protocol::Bgp => routes.extend(
                        pool.bgp_advertisements
                            .iter()
                            .map(|advertisement| route_for(advertisement, address.ip)),
                    ),
                    Protocol::Layer2 => {
                        layer2.insert(address.ip);
                    }
                }
            }
        }
        (routes, layer2)
    }

    fn layer2_events(&mut self, layer2: BTreeSet<IpAddr>) -> Vec<Layer2Event> {
        let events = self
            .layer2
            .difference(&layer2)
            .map(|ip| Layer2Event::Removed(*ip))
            .chain(layer2.difference(&self.layer2).map(|ip| Layer2Event::Added(*ip)))
            .collect();
        self.layer2 = layer2;
        events
    }

    fn fill_report(&self, report: &mut StatusReport) {
        report.generated_at = Some(Utc::now());
        report.assignments = self
            .allocator
            .allocations()
            .into_iter()
            .map(|allocation| Assignment {
                service: allocation.service.to_string(),
                addresses: allocation.addresses.clone(),
            })
            .collect();
        report.pools = self
            .allocator
            .pools()
            .iter()
            .filter_map(|pool| {
                let stats = self.allocator.pool_stats(&pool.name)?;
                Some(PoolReport {
                    name: pool.name.clone(),
                    protocol: pool.protocol,
                    usage: IPAddressPoolStatus::from(&stats),
                    services: stats.services,
                })
            })
            .collect();
        report.layer2_addresses = self.layer2.iter().copied().collect();

        let statuses = self.speaker.statuses();
        let active: BTreeSet<String> = statuses.iter().map(|s| s.config.name.clone()).collect();
        self.board.retain_sessions(&active);
        report.peers = statuses.into_iter().map(|s| s.config).collect();
    }
}

/// Converts and validates the configuration part of a snapshot.
fn load_config(snapshot: &Snapshot) -> Result<(Pools, Vec<PeerConfig>), ConfigError> {
    let pool_configs = crds::pool_configs(&snapshot.pools, &snapshot.advertisements)?;
    let pools = Pools::from_configs(&pool_configs)?;
    let peers = crds::peer_configs(&snapshot.peers)?;
    Ok((pools, peers))
}

/// LoadBalancer services by identity, and services whose request is invalid.
fn collect_services(snapshot: &Snapshot) -> (BTreeMap<ServiceId, ServiceEntry>, BTreeMap<ServiceId, String>) {
    let mut entries = BTreeMap::new();
    let mut invalid = BTreeMap::new();
    for service in &snapshot.services {
        match ServiceEntry::from_service(service) {
            Ok(Some(entry)) => {
                if entries.contains_key(&entry.id) {
                    warn!("Ignoring duplicate service {}", entry.id);
                    continue;
                }
                entries.insert(entry.id.clone(), entry);
            }
            Ok(None) => {}
            Err(e) => {
                let name = service.metadata.name.clone().unwrap_or_default();
                let namespace = service
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| "default".to_string());
                let id = ServiceId::new(namespace, name);
                warn!("Service {} has an invalid request: {}", id, e);
                invalid.insert(id, e.to_string());
            }
        }
    }
    (entries, invalid)
}

fn route_for(advertisement: &BgpAdvertisement, ip: IpAddr) -> Route {
    Route {
        prefix: advertisement.prefix_for(ip),
        local_pref: advertisement.local_pref,
        communities: advertisement.communities.iter().map(|c| c.0).collect(),
        peers: advertisement.peers.clone(),
    }
}

fn same_addresses(a: &[IpAddr], b: &[IpAddr]) -> bool {
    let a: BTreeSet<&IpAddr> = a.iter().collect();
    let b: BTreeSet<&IpAddr> = b.iter().collect();
    a == b
}
