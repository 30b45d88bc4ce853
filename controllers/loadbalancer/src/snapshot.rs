//! Manifest snapshots.
//!
//! The manifest is a multi-document YAML stream of `IPAddressPool`,
//! `BGPAdvertisement`, `BGPPeer` and core `Service` and `Node` objects.
//! Documents of other kinds are skipped.
//!
//! Services are turned into allocation requests here, following the
//! annotations LoadBalancer users already know:
//! - `metallb.universe.tf/address-pool` names the pool;
//! - `metallb.universe.tf/loadBalancerIPs` (comma list) or
//!   `spec.loadBalancerIP` asks for exact addresses;
//! - `metallb.universe.tf/allow-shared-ip` is the sharing key.

use crate::error::{ServiceError, SnapshotError};
use crds::{BGPAdvertisement, BGPPeer, IPAddressPool};
use ipam::{AllocationRequest, FamilyPolicy, Port, PortProtocol, ServiceId};
use k8s_openapi::api::core::v1::{Node, Service, ServiceSpec};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::debug;

/// Annotation naming the pool to allocate from.
pub const ANNOTATION_ADDRESS_POOL: &str = "metallb.universe.tf/address-pool";
/// Annotation listing requested addresses.
pub const ANNOTATION_LOAD_BALANCER_IPS: &str = "metallb.universe.tf/loadBalancerIPs";
/// Annotation holding the sharing key.
pub const ANNOTATION_ALLOW_SHARED_IP: &str = "metallb.universe.tf/allow-shared-ip";

/// Everything the controller reconciles from, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Address pools
    pub pools: Vec<IPAddressPool>,
    /// BGP advertisements
    pub advertisements: Vec<BGPAdvertisement>,
    /// BGP peers
    pub peers: Vec<BGPPeer>,
    /// Services of every type
    pub services: Vec<Service>,
    /// Nodes, for their labels
    pub nodes: Vec<Node>,
}

impl Snapshot {
    /// Parses a manifest.
    pub fn parse(text: &str) -> Result<Self, SnapshotError> {
        let mut snapshot = Snapshot::default();
        for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|source| SnapshotError::Yaml { index, source })?;
            if value.is_null() {
                continue;
            }
            let kind = value
                .get("kind")
                .and_then(serde_yaml::Value::as_str)
                .ok_or(SnapshotError::MissingKind(index))?
                .to_string();
            let invalid = |source| SnapshotError::InvalidDocument {
                index,
                kind: kind.clone(),
                source,
            };
            match kind.as_str() {
                "IPAddressPool" => snapshot.pools.push(serde_yaml::from_value(value).map_err(invalid)?),
                "BGPAdvertisement" => snapshot
                    .advertisements
                    .push(serde_yaml::from_value(value).map_err(invalid)?),
                "BGPPeer" => snapshot.peers.push(serde_yaml::from_value(value).map_err(invalid)?),
                "Service" => snapshot.services.push(serde_yaml::from_value(value).map_err(invalid)?),
                "Node" => snapshot.nodes.push(serde_yaml::from_value(value).map_err(invalid)?),
                other => debug!("Skipping document {} of kind {}", index, other),
            }
        }
        Ok(snapshot)
    }

    /// Labels of the node called `name`, if the manifest declares it.
    #[must_use]
    pub fn node_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.nodes
            .iter()
            .find(|node| node.metadata.name.as_deref() == Some(name))
            .map(|node| node.metadata.labels.clone().unwrap_or_default())
    }
}

/// A LoadBalancer service as the allocator sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Service identity
    pub id: ServiceId,
    /// What the service asks for
    pub request: AllocationRequest,
    /// Addresses recorded in `status.loadBalancer.ingress`
    pub recorded: Vec<IpAddr>,
}

impl ServiceEntry {
    /// Converts a service; `Ok(None)` unless it is of type `LoadBalancer`.
    pub fn from_service(service: &Service) -> Result<Option<Self>, ServiceError> {
        let Some(spec) = service.spec.as_ref() else {
            return Ok(None);
        };
        if spec.type_.as_deref() != Some("LoadBalancer") {
            return Ok(None);
        }
        let name = service
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(ServiceError::MissingName)?;
        let namespace = service
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let annotations = service.metadata.annotations.clone().unwrap_or_default();

        let request = AllocationRequest {
            pool: annotations
                .get(ANNOTATION_ADDRESS_POOL)
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            addresses: requested_addresses(&annotations, spec)?,
            sharing_key: annotations
                .get(ANNOTATION_ALLOW_SHARED_IP)
                .cloned()
                .unwrap_or_default(),
            backend_key: backend_key(spec),
            ports: ports(spec)?,
            families: families(spec),
        };

        let recorded = service
            .status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| {
                ingress
                    .iter()
                    .filter_map(|entry| entry.ip.as_deref())
                    .filter_map(|ip| ip.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(Self {
            id: ServiceId::new(namespace, name),
            request,
            recorded,
        }))
    }
}

fn requested_addresses(
    annotations: &BTreeMap<String, String>,
    spec: &ServiceSpec,
) -> Result<Vec<IpAddr>, ServiceError> {
    let annotated = annotations
        .get(ANNOTATION_LOAD_BALANCER_IPS)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty());
    let legacy = spec.load_balancer_ip.as_deref().filter(|v| !v.trim().is_empty());

    let text = match (annotated, legacy) {
        (Some(_), Some(_)) => {
            return Err(ServiceError::ConflictingAddressRequests(ANNOTATION_LOAD_BALANCER_IPS));
        }
        (Some(text), None) | (None, Some(text)) => text,
        (None, None) => return Ok(Vec::new()),
    };
    text.split(',')
        .map(str::trim)
        .map(|ip| {
            ip.parse().map_err(|source| ServiceError::InvalidAddress {
                value: ip.to_string(),
                source,
            })
        })
        .collect()
}

/// Sharing services must agree on where traffic lands. With the `Local`
/// policy that is the pod selector.
fn backend_key(spec: &ServiceSpec) -> String {
    if spec.external_traffic_policy.as_deref() != Some("Local") {
        return String::new();
    }
    spec.selector
        .as_ref()
        .map(|selector| {
            selector
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

fn ports(spec: &ServiceSpec) -> Result<Vec<Port>, ServiceError> {
    spec.ports
        .iter()
        .flatten()
        .map(|port| {
            let number = u16::try_from(port.port).map_err(|source| ServiceError::InvalidPort {
                port: port.port,
                source,
            })?;
            let protocol = match port.protocol.as_deref() {
                Some("UDP") => PortProtocol::Udp,
                Some("SCTP") => PortProtocol::Sctp,
                _ => PortProtocol::Tcp,
            };
            Ok(Port {
                protocol,
                port: number,
            })
        })
        .collect()
}

/// Families from `ipFamilies`, then `clusterIPs`, then `ipFamilyPolicy`.
fn families(spec: &ServiceSpec) -> FamilyPolicy {
    let from_list = |v4: bool, v6: bool| match (v4, v6) {
        (true, true) => Some(FamilyPolicy::DualStack),
        (true, false) => Some(FamilyPolicy::V4),
        (false, true) => Some(FamilyPolicy::V6),
        (false, false) => None,
    };

    if let Some(declared) = spec.ip_families.as_ref().filter(|f| !f.is_empty()) {
        let v4 = declared.iter().any(|f| f == "IPv4");
        let v6 = declared.iter().any(|f| f == "IPv6");
        if let Some(policy) = from_list(v4, v6) {
            return policy;
        }
    }

    if let Some(cluster_ips) = spec.cluster_ips.as_ref() {
        let parsed: Vec<IpAddr> = cluster_ips.iter().filter_map(|ip| ip.parse().ok()).collect();
        let v4 = parsed.iter().any(IpAddr::is_ipv4);
        let v6 = parsed.iter().any(IpAddr::is_ipv6);
        if let Some(policy) = from_list(v4, v6) {
            return policy;
        }
    }

    match spec.ip_family_policy.as_deref() {
        Some("RequireDualStack" | "PreferDualStack") => FamilyPolicy::DualStack,
        _ => FamilyPolicy::V4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: metallb.io/v1beta1
kind: IPAddressPool
metadata:
  name: pool-a
spec:
  addresses: ["192.168.10.0/24"]
---
apiVersion: metallb.io/v1beta1
kind: BGPAdvertisement
metadata:
  name: adv
spec:
  ipAddressPools: ["pool-a"]
---
apiVersion: metallb.io/v1beta2
kind: BGPPeer
metadata:
  name: tor
spec:
  myASN: 64512
  peerASN: 64513
  peerAddress: 10.0.0.254
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: ignored
---
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: shop
  annotations:
    metallb.universe.tf/address-pool: pool-a
    metallb.universe.tf/allow-shared-ip: web-key
spec:
  type: LoadBalancer
  externalTrafficPolicy: Local
  selector:
    app: web
    tier: front
  ports:
    - port: 80
    - port: 53
      protocol: UDP
status:
  loadBalancer:
    ingress:
      - ip: 192.168.10.7
"#;

    fn service(yaml: &str) -> Service {
        serde_yaml::from_str(&format!("apiVersion: v1\nkind: Service\n{yaml}")).unwrap()
    }

    #[test]
    fn test_parse_manifest() {
        let snapshot = Snapshot::parse(MANIFEST).unwrap();
        assert_eq!(snapshot.pools.len(), 1);
        assert_eq!(snapshot.advertisements.len(), 1);
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.services.len(), 1);
        assert_eq!(snapshot.peers[0].spec.peer_asn, 64513);
    }

    #[test]
    fn test_parse_rejects_bad_documents() {
        assert!(matches!(
            Snapshot::parse("metadata: {name: x}\n"),
            Err(SnapshotError::MissingKind(0))
        ));
        assert!(matches!(
            Snapshot::parse("---\n---\nkind: BGPPeer\nmetadata: {name: x}\nspec: {myASN: nope}\n"),
            Err(SnapshotError::InvalidDocument { .. })
        ));
        assert!(Snapshot::parse("").unwrap().pools.is_empty());
    }

    #[test]
    fn test_node_labels() {
        let snapshot = Snapshot::parse(
            "kind: Node\napiVersion: v1\nmetadata:\n  name: node-a\n  labels: {rack: b}\n---\nkind: Node\napiVersion: v1\nmetadata: {name: node-b}\n",
        )
        .unwrap();
        assert_eq!(snapshot.node_labels("node-a").unwrap()["rack"], "b");
        assert!(snapshot.node_labels("node-b").unwrap().is_empty());
        assert_eq!(snapshot.node_labels("node-c"), None);
    }

    #[test]
    fn test_service_entry() {
        let snapshot = Snapshot::parse(MANIFEST).unwrap();
        let entry = ServiceEntry::from_service(&snapshot.services[0]).unwrap().unwrap();
        assert_eq!(entry.id, ServiceId::new("shop", "web"));
        assert_eq!(entry.request.pool.as_deref(), Some("pool-a"));
        assert_eq!(entry.request.sharing_key, "web-key");
        assert_eq!(entry.request.backend_key, "app=web,tier=front");
        assert_eq!(entry.request.ports, vec![Port::tcp(80), Port::udp(53)]);
        assert_eq!(entry.request.families, FamilyPolicy::V4);
        assert_eq!(entry.recorded, vec!["192.168.10.7".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_non_load_balancer_is_skipped() {
        let svc = service("metadata: {name: a}\nspec: {type: ClusterIP}\n");
        assert_eq!(ServiceEntry::from_service(&svc).unwrap(), None);
    }

    #[test]
    fn test_requested_addresses() {
        let svc = service(
            "metadata:\n  name: a\n  annotations:\n    metallb.universe.tf/loadBalancerIPs: 10.0.0.1, fd00::1\nspec:\n  type: LoadBalancer\n  ipFamilies: [IPv4, IPv6]\n",
        );
        let entry = ServiceEntry::from_service(&svc).unwrap().unwrap();
        assert_eq!(entry.id.namespace, "default");
        assert_eq!(entry.request.addresses.len(), 2);
        assert_eq!(entry.request.families, FamilyPolicy::DualStack);

        let legacy = service("metadata: {name: a}\nspec: {type: LoadBalancer, loadBalancerIP: 10.0.0.9}\n");
        let entry = ServiceEntry::from_service(&legacy).unwrap().unwrap();
        assert_eq!(entry.request.addresses, vec!["10.0.0.9".parse::<IpAddr>().unwrap()]);
        assert_eq!(entry.request.backend_key, "");
    }

    #[test]
    fn test_requested_address_errors() {
        let both = service(
            "metadata:\n  name: a\n  annotations:\n    metallb.universe.tf/loadBalancerIPs: 10.0.0.1\nspec:\n  type: LoadBalancer\n  loadBalancerIP: 10.0.0.2\n",
        );
        assert_eq!(
            ServiceEntry::from_service(&both).unwrap_err(),
            ServiceError::ConflictingAddressRequests(ANNOTATION_LOAD_BALANCER_IPS)
        );

        let garbage = service("metadata: {name: a}\nspec: {type: LoadBalancer, loadBalancerIP: nope}\n");
        assert!(matches!(
            ServiceEntry::from_service(&garbage),
            Err(ServiceError::InvalidAddress { ref value, .. }) if value == "nope"
        ));

        let huge = service("metadata: {name: a}\nspec: {type: LoadBalancer, ports: [{port: 70000}]}\n");
        let err = ServiceEntry::from_service(&huge).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidPort { port: 70000, .. }));
        assert!(err.to_string().starts_with("invalid port 70000: "));
    }

    #[test]
    fn test_families_fallbacks() {
        let v6 = service("metadata: {name: a}\nspec: {type: LoadBalancer, clusterIPs: [\"fd00::10\"]}\n");
        let entry = ServiceEntry::from_service(&v6).unwrap().unwrap();
        assert_eq!(entry.request.families, FamilyPolicy::V6);

        let dual = service("metadata: {name: a}\nspec: {type: LoadBalancer, ipFamilyPolicy: RequireDualStack}\n");
        let entry = ServiceEntry::from_service(&dual).unwrap().unwrap();
        assert_eq!(entry.request.families, FamilyPolicy::DualStack);
    }
}
