//! # Address Allocator
//!
//! Maps services to addresses drawn from the configured [`Pools`].
//!
//! The allocator is a plain in-memory value. It holds no I/O and no locks;
//! the reconciliation loop is its only writer. After a restart it is rebuilt
//! by replaying the addresses recorded on each service through [`Allocator::assign`].
//!
//! Choice is deterministic: pools are scanned in declaration order, ranges in
//! declaration order, and addresses in ascending order. The first address
//! that is free, or that may be shared with its current owners, wins.

use crate::error::AllocationError;
use crate::pool::{IpFamily, Pool, Pools};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Identity of a service: namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    /// Service namespace
    pub namespace: String,
    /// Service name
    pub name: String,
}

impl ServiceId {
    /// Creates a service identity.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Transport protocol of a service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortProtocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

/// A service port, as relevant for address sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Port {
    /// Transport protocol
    pub protocol: PortProtocol,
    /// Port number
    pub port: u16,
}

impl Port {
    /// A TCP port.
    #[must_use]
    pub fn tcp(port: u16) -> Self {
        Self { protocol: PortProtocol::Tcp, port }
    }

    /// A UDP port.
    #[must_use]
    pub fn udp(port: u16) -> Self {
        Self { protocol: PortProtocol::Udp, port }
    }
}

/// Address families a service wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FamilyPolicy {
    /// One IPv4 address
    #[default]
    V4,
    /// One IPv6 address
    V6,
    /// One address of each family
    DualStack,
}

impl FamilyPolicy {
    /// Families in allocation order, IPv4 first.
    #[must_use]
    pub fn families(self) -> &'static [IpFamily] {
        match self {
            FamilyPolicy::V4 => &[IpFamily::V4],
            FamilyPolicy::V6 => &[IpFamily::V6],
            FamilyPolicy::DualStack => &[IpFamily::V4, IpFamily::V6],
        }
    }
}

impl fmt::Display for FamilyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamilyPolicy::V4 => f.write_str("IPv4"),
            FamilyPolicy::V6 => f.write_str("IPv6"),
            FamilyPolicy::DualStack => f.write_str("dual-stack"),
        }
    }
}

/// What a service asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Pool the addresses must come from
    pub pool: Option<String>,
    /// Exact addresses wanted, at most one per family
    pub addresses: Vec<IpAddr>,
    /// Services with equal non-empty keys may share an address
    pub sharing_key: String,
    /// Sharing services must also agree on this key
    pub backend_key: String,
    /// Ports the service exposes
    pub ports: Vec<Port>,
    /// Families to allocate
    pub families: FamilyPolicy,
}

impl AllocationRequest {
    /// Request for an address from a named pool.
    pub fn from_pool(pool: impl Into<String>) -> Self {
        Self {
            pool: Some(pool.into()),
            ..Self::default()
        }
    }

    /// Request for exact addresses.
    #[must_use]
    pub fn for_addresses(addresses: Vec<IpAddr>) -> Self {
        let families = family_policy_of(&addresses);
        Self {
            addresses,
            families,
            ..Self::default()
        }
    }

    /// Sets the sharing key.
    #[must_use]
    pub fn with_sharing_key(mut self, key: impl Into<String>) -> Self {
        self.sharing_key = key.into();
        self
    }

    /// Sets the backend key.
    #[must_use]
    pub fn with_backend_key(mut self, key: impl Into<String>) -> Self {
        self.backend_key = key.into();
        self
    }

    /// Sets the ports.
    #[must_use]
    pub fn with_ports(mut self, ports: Vec<Port>) -> Self {
        self.ports = ports;
        self
    }

    /// Sets the families.
    #[must_use]
    pub fn with_families(mut self, families: FamilyPolicy) -> Self {
        self.families = families;
        self
    }
}

/// The family policy matching a list of addresses (IPv4 when empty).
#[must_use]
pub fn family_policy_of(addresses: &[IpAddr]) -> FamilyPolicy {
    let v4 = addresses.iter().any(IpAddr::is_ipv4);
    let v6 = addresses.iter().any(IpAddr::is_ipv6);
    match (v4, v6) {
        (true, true) => FamilyPolicy::DualStack,
        (false, true) => FamilyPolicy::V6,
        _ => FamilyPolicy::V4,
    }
}

/// One allocated address and the pool it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatedAddress {
    /// The address
    pub ip: IpAddr,
    /// Pool that contains it
    pub pool: String,
}

/// Addresses held by one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Owning service
    pub service: ServiceId,
    /// One address per family, IPv4 first
    pub addresses: Vec<AllocatedAddress>,
    /// Sharing key the addresses were taken with
    pub sharing_key: String,
    /// Backend key the addresses were taken with
    pub backend_key: String,
    /// Ports of the service
    pub ports: BTreeSet<Port>,
}

impl Allocation {
    /// The allocated addresses, IPv4 first.
    #[must_use]
    pub fn ips(&self) -> Vec<IpAddr> {
        self.addresses.iter().map(|a| a.ip).collect()
    }
}

/// An allocation dropped because the new pool configuration no longer covers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleAllocation {
    /// The dropped allocation
    pub allocation: Allocation,
    /// The address that is no longer usable
    pub ip: IpAddr,
}

/// Usage summary of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Pool name
    pub pool: String,
    /// Usable IPv4 addresses
    pub capacity_v4: u64,
    /// Usable IPv6 addresses
    pub capacity_v6: u64,
    /// Distinct IPv4 addresses handed out
    pub in_use_v4: u64,
    /// Distinct IPv6 addresses handed out
    pub in_use_v6: u64,
    /// Services holding an address of the pool
    pub services: u64,
}

/// In-memory address allocator.
#[derive(Debug, Default)]
pub struct Allocator {
    pools: Pools,
    allocated: HashMap<ServiceId, Allocation>,
    services_on_ip: BTreeMap<IpAddr, BTreeSet<ServiceId>>,
}

impl Allocator {
    /// Creates an allocator over a validated pool set.
    #[must_use]
    pub fn new(pools: Pools) -> Self {
        Self {
            pools,
            allocated: HashMap::new(),
            services_on_ip: BTreeMap::new(),
        }
    }

    /// The current pool configuration.
    #[must_use]
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// The allocation of one service.
    #[must_use]
    pub fn allocation(&self, service: &ServiceId) -> Option<&Allocation> {
        self.allocated.get(service)
    }

    /// All allocations, ordered by service.
    #[must_use]
    pub fn allocations(&self) -> Vec<&Allocation> {
        let mut all: Vec<&Allocation> = self.allocated.values().collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    /// Services currently holding `ip`.
    #[must_use]
    pub fn owners(&self, ip: &IpAddr) -> Vec<&ServiceId> {
        self.services_on_ip
            .get(ip)
            .map(|owners| owners.iter().collect())
            .unwrap_or_default()
    }

    /// Assigns addresses to `service`, returning them IPv4 first.
    ///
    /// Idempotent: an existing allocation that still satisfies `request` is
    /// returned unchanged. Otherwise the service gets a fresh allocation, or
    /// keeps its old one if the request cannot be met.
    pub fn assign(
        &mut self,
        service: &ServiceId,
        request: &AllocationRequest,
    ) -> Result<Vec<IpAddr>, AllocationError> {
        check_request_shape(request)?;

        if let Some(existing) = self.allocated.get(service) {
            if self.satisfies(existing, request) {
                for address in &existing.addresses {
                    self.check_sharing(address.ip, service, request)?;
                }
                let ips = existing.ips();
                if let Some(existing) = self.allocated.get_mut(service) {
                    existing.sharing_key.clone_from(&request.sharing_key);
                    existing.backend_key.clone_from(&request.backend_key);
                    existing.ports = request.ports.iter().copied().collect();
                }
                return Ok(ips);
            }
        }

        let previous = self.release(service);
        match self.allocate(service, request) {
            Ok(allocation) => {
                let ips = allocation.ips();
                debug!("Assigned {:?} to {}", ips, service);
                self.record(allocation);
                Ok(ips)
            }
            Err(e) => {
                if let Some(previous) = previous {
                    self.record(previous);
                }
                Err(e)
            }
        }
    }

    /// Releases the addresses of `service`. Returns what was released.
    pub fn unassign(&mut self, service: &ServiceId) -> Option<Allocation> {
        let released = self.release(service);
        if let Some(allocation) = &released {
            debug!("Released {:?} from {}", allocation.ips(), service);
        }
        released
    }

    /// Replaces the pool configuration.
    ///
    /// Allocations holding an address the new pools no longer allow are
    /// removed and returned, ordered by service. Surviving addresses are
    /// relabelled with the pool that now contains them.
    pub fn set_pools(&mut self, pools: Pools) -> Vec<StaleAllocation> {
        let mut stale_services: Vec<(ServiceId, IpAddr)> = Vec::new();
        for (service, allocation) in &mut self.allocated {
            let mut lost = None;
            for address in &mut allocation.addresses {
                match pools.pool_for(&address.ip) {
                    Some(pool) => address.pool.clone_from(&pool.name),
                    None => {
                        lost.get_or_insert(address.ip);
                    }
                }
            }
            if let Some(ip) = lost {
                stale_services.push((service.clone(), ip));
            }
        }
        self.pools = pools;

        stale_services.sort();
        stale_services
            .into_iter()
            .filter_map(|(service, ip)| {
                self.release(&service)
                    .map(|allocation| StaleAllocation { allocation, ip })
            })
            .collect()
    }

    /// Usage of a pool, `None` if it does not exist.
    #[must_use]
    pub fn pool_stats(&self, name: &str) -> Option<PoolStats> {
        let pool = self.pools.get(name)?;
        let (capacity_v4, capacity_v6) = pool.size();
        let mut addresses = BTreeSet::new();
        let mut services = 0u64;
        for allocation in self.allocated.values() {
            let mut counted = false;
            for address in allocation.addresses.iter().filter(|a| a.pool == name) {
                addresses.insert(address.ip);
                counted = true;
            }
            if counted {
                services += 1;
            }
        }
        let in_use_v4 = addresses.iter().filter(|ip| ip.is_ipv4()).count();
        let in_use_v6 = addresses.len() - in_use_v4;
        Some(PoolStats {
            pool: name.to_string(),
            capacity_v4,
            capacity_v6,
            in_use_v4: u64::try_from(in_use_v4).unwrap_or(u64::MAX),
            in_use_v6: u64::try_from(in_use_v6).unwrap_or(u64::MAX),
            services,
        })
    }

    fn satisfies(&self, existing: &Allocation, request: &AllocationRequest) -> bool {
        let families: Vec<IpFamily> = existing
            .addresses
            .iter()
            .map(|a| IpFamily::of(&a.ip))
            .collect();
        if families != request.families.families() {
            return false;
        }
        if !request.addresses.is_empty() {
            let mut wanted = request.addresses.clone();
            sort_by_family(&mut wanted);
            if wanted != existing.ips() {
                return false;
            }
        }
        existing.addresses.iter().all(|address| {
            let Some(pool) = self.pools.pool_for(&address.ip) else {
                return false;
            };
            request.pool.as_ref().is_none_or(|wanted| *wanted == pool.name)
        })
    }

    fn allocate(
        &self,
        service: &ServiceId,
        request: &AllocationRequest,
    ) -> Result<Allocation, AllocationError> {
        if !request.addresses.is_empty() {
            let mut wanted = request.addresses.clone();
            sort_by_family(&mut wanted);
            let mut addresses = Vec::with_capacity(wanted.len());
            for ip in wanted {
                let pool = self
                    .pools
                    .pool_for(&ip)
                    .ok_or(AllocationError::AddressNotInAnyPool(ip))?;
                if let Some(requested) = &request.pool {
                    if *requested != pool.name {
                        return Err(AllocationError::AddressNotInRequestedPool {
                            ip,
                            pool: requested.clone(),
                        });
                    }
                }
                self.check_sharing(ip, service, request)?;
                addresses.push(AllocatedAddress { ip, pool: pool.name.clone() });
            }
            return Ok(new_allocation(service, request, addresses));
        }

        if let Some(name) = &request.pool {
            let pool = self
                .pools
                .get(name)
                .ok_or_else(|| AllocationError::UnknownPool(name.clone()))?;
            return self
                .allocate_from_pool(pool, service, request)
                .ok_or_else(|| AllocationError::PoolExhausted(name.clone()));
        }

        let eligible: Vec<&Pool> = self
            .pools
            .iter()
            .filter(|pool| pool.auto_assign)
            .filter(|pool| request.families.families().iter().all(|f| pool.serves(*f)))
            .collect();
        if eligible.is_empty() {
            return Err(AllocationError::NoEligiblePool);
        }
        if let Some(found) = eligible
            .iter()
            .find_map(|pool| self.allocate_from_pool(pool, service, request))
        {
            return Ok(found);
        }
        match eligible.as_slice() {
            [only] => Err(AllocationError::PoolExhausted(only.name.clone())),
            _ => Err(AllocationError::AllPoolsExhausted),
        }
    }

    fn allocate_from_pool(
        &self,
        pool: &Pool,
        service: &ServiceId,
        request: &AllocationRequest,
    ) -> Option<Allocation> {
        let mut addresses = Vec::new();
        for family in request.families.families() {
            let ip = pool
                .addresses(*family)
                .find(|ip| self.check_sharing(*ip, service, request).is_ok())?;
            addresses.push(AllocatedAddress { ip, pool: pool.name.clone() });
        }
        Some(new_allocation(service, request, addresses))
    }

    /// Whether `service` may hold `ip` next to its current owners.
    fn check_sharing(
        &self,
        ip: IpAddr,
        service: &ServiceId,
        request: &AllocationRequest,
    ) -> Result<(), AllocationError> {
        let Some(owners) = self.services_on_ip.get(&ip) else {
            return Ok(());
        };
        let ports: BTreeSet<Port> = request.ports.iter().copied().collect();
        for owner in owners.iter().filter(|owner| *owner != service) {
            let Some(other) = self.allocated.get(owner) else {
                continue;
            };
            let compatible = !request.sharing_key.is_empty()
                && request.sharing_key == other.sharing_key
                && request.backend_key == other.backend_key
                && ports.is_disjoint(&other.ports);
            if !compatible {
                return Err(AllocationError::AddressInUse {
                    ip,
                    owner: owner.to_string(),
                });
            }
        }
        Ok(())
    }

    fn record(&mut self, allocation: Allocation) {
        for address in &allocation.addresses {
            self.services_on_ip
                .entry(address.ip)
                .or_default()
                .insert(allocation.service.clone());
        }
        self.allocated.insert(allocation.service.clone(), allocation);
    }

    fn release(&mut self, service: &ServiceId) -> Option<Allocation> {
        let allocation = self.allocated.remove(service)?;
        for address in &allocation.addresses {
            if let Some(owners) = self.services_on_ip.get_mut(&address.ip) {
                owners.remove(service);
                if owners.is_empty() {
                    self.services_on_ip.remove(&address.ip);
                }
            }
        }
        Some(allocation)
    }
}

fn check_request_shape(request: &AllocationRequest) -> Result<(), AllocationError> {
    if request.addresses.is_empty() {
        return Ok(());
    }
    let v4 = request.addresses.iter().filter(|ip| ip.is_ipv4()).count();
    let v6 = request.addresses.len() - v4;
    if v4 > 1 || v6 > 1 {
        return Err(AllocationError::TooManyAddresses(request.addresses.clone()));
    }
    if family_policy_of(&request.addresses) != request.families {
        return Err(AllocationError::FamilyMismatch {
            addresses: request.addresses.clone(),
            families: request.families.to_string(),
        });
    }
    Ok(())
}

fn new_allocation(
    service: &ServiceId,
    request: &AllocationRequest,
    addresses: Vec<AllocatedAddress>,
) -> Allocation {
    Allocation {
        service: service.clone(),
        addresses,
        sharing_key: request.sharing_key.clone(),
        backend_key: request.backend_key.clone(),
        ports: request.ports.iter().copied().collect(),
    }
}

fn sort_by_family(addresses: &mut [IpAddr]) {
    addresses.sort_by_key(|ip| IpFamily::of(ip));
}
