//! Unit tests for the reconciler

#[cfg(test)]
mod tests {
    use crate::reconciler::{Layer2Event, Reconciler};
    use crate::snapshot::Snapshot;
    use crate::status::StatusBoard;
    use bgp::mock::{DuplexDialer, MockPeer};
    use bgp::Speaker;
    use ipam::ServiceId;
    use ipnet::IpNet;
    use std::collections::BTreeMap;
    use std::fmt::Write;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    const POOL_A: &str = "
apiVersion: metallb.io/v1beta1
kind: IPAddressPool
metadata:
  name: pool-a
spec:
  addresses: [192.168.10.0/24]
";

    fn reconciler() -> (Reconciler, StatusBoard) {
        let (dialer, _accepted) = DuplexDialer::channel();
        let board = StatusBoard::new();
        let speaker = Speaker::new("node-a", BTreeMap::new(), Arc::new(dialer))
            .with_status_callback(board.session_callback());
        (Reconciler::new(speaker, board.clone()), board)
    }

    fn service(name: &str, extra_annotations: &str, recorded: Option<&str>) -> String {
        let mut doc = format!("---\napiVersion: v1\nkind: Service\nmetadata:\n  name: {name}\n  namespace: default\n");
        if !extra_annotations.is_empty() {
            let _ = write!(doc, "  annotations:\n    {extra_annotations}\n");
        }
        doc.push_str("spec:\n  type: LoadBalancer\n  ports: [{port: 80}]\n");
        if let Some(ip) = recorded {
            let _ = write!(doc, "status:\n  loadBalancer:\n    ingress: [{{ip: \"{ip}\"}}]\n");
        }
        doc
    }

    fn snapshot(docs: &[&str]) -> Snapshot {
        Snapshot::parse(&docs.join("\n---\n")).unwrap()
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn ips_of(reconciler: &Reconciler, name: &str) -> Vec<IpAddr> {
        reconciler
            .allocator()
            .allocation(&ServiceId::new("default", name))
            .map(ipam::Allocation::ips)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_pool_a_fills_in_order_then_exhausts() {
        let (mut reconciler, board) = reconciler();
        let buggy_pool_a = format!("{POOL_A}  avoidBuggyIPs: true\n");
        let services: Vec<String> = (0..255).map(|i| service(&format!("svc-{i:03}"), "", None)).collect();
        let mut docs = vec![buggy_pool_a.as_str()];
        docs.extend(services.iter().map(String::as_str));
        reconciler.reconcile(&snapshot(&docs)).await;

        for i in 0..254u8 {
            assert_eq!(
                ips_of(&reconciler, &format!("svc-{i:03}")),
                vec![IpAddr::V4(Ipv4Addr::new(192, 168, 10, i + 1))]
            );
        }
        assert!(ips_of(&reconciler, "svc-254").is_empty());
        let report = board.report();
        assert_eq!(report.failures["default/svc-254"], "no available addresses in pool pool-a");
        assert_eq!(report.pools[0].usage.assigned_ipv4, 254);
        assert_eq!(report.pools[0].usage.available_ipv4, 0);
    }

    #[tokio::test]
    async fn test_recorded_addresses_are_replayed_first() {
        let (mut reconciler, _) = reconciler();
        let a = service("a", "", None);
        let b = service("b", "", Some("192.168.10.1"));
        reconciler.reconcile(&snapshot(&[POOL_A, &a, &b])).await;
        assert_eq!(ips_of(&reconciler, "b"), vec![ip("192.168.10.1")]);
        assert_eq!(ips_of(&reconciler, "a"), vec![ip("192.168.10.2")]);
    }

    #[tokio::test]
    async fn test_recorded_address_outside_pools_is_reallocated() {
        let (mut reconciler, board) = reconciler();
        let a = service("a", "", Some("10.9.9.9"));
        reconciler.reconcile(&snapshot(&[POOL_A, &a])).await;
        assert_eq!(ips_of(&reconciler, "a"), vec![ip("192.168.10.1")]);
        assert!(board.report().failures.is_empty());
    }

    #[tokio::test]
    async fn test_recorded_address_in_other_pool_moves() {
        let (mut reconciler, _) = reconciler();
        let pool_b = "
apiVersion: metallb.io/v1beta1
kind: IPAddressPool
metadata:
  name: pool-b
spec:
  addresses: [10.0.1.0/24]
";
        let a = service("a", "metallb.universe.tf/address-pool: pool-b", Some("192.168.10.5"));
        reconciler.reconcile(&snapshot(&[POOL_A, pool_b, &a])).await;
        assert_eq!(ips_of(&reconciler, "a"), vec![ip("10.0.1.1")]);
    }

    #[tokio::test]
    async fn test_rejected_config_keeps_previous_pools() {
        let (mut reconciler, board) = reconciler();
        let a = service("a", "", None);
        reconciler.reconcile(&snapshot(&[POOL_A, &a])).await;
        assert_eq!(ips_of(&reconciler, "a"), vec![ip("192.168.10.1")]);

        let overlapping = "
apiVersion: metallb.io/v1beta1
kind: IPAddressPool
metadata:
  name: pool-z
spec:
  addresses: [192.168.10.128/25]
";
        let b = service("b", "", None);
        reconciler.reconcile(&snapshot(&[POOL_A, overlapping, &a, &b])).await;

        let report = board.report();
        assert!(report.config_error.unwrap().contains("overlaps"));
        assert_eq!(report.pools.len(), 1);
        assert_eq!(ips_of(&reconciler, "a"), vec![ip("192.168.10.1")]);
        assert_eq!(ips_of(&reconciler, "b"), vec![ip("192.168.10.2")]);
    }

    #[tokio::test]
    async fn test_layer2_events_follow_services() {
        let (mut reconciler, _) = reconciler();
        let a = service("a", "", None);
        let b = service("b", "", None);
        let events = reconciler.reconcile(&snapshot(&[POOL_A, &a, &b])).await;
        assert_eq!(
            events,
            vec![
                Layer2Event::Added(ip("192.168.10.1")),
                Layer2Event::Added(ip("192.168.10.2")),
            ]
        );

        let events = reconciler.reconcile(&snapshot(&[POOL_A, &b])).await;
        assert_eq!(events, vec![Layer2Event::Removed(ip("192.168.10.1"))]);
        assert!(ips_of(&reconciler, "a").is_empty());

        assert!(reconciler.reconcile(&snapshot(&[POOL_A, &b])).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_service_request_is_reported() {
        let (mut reconciler, board) = reconciler();
        let mut bad = service("bad", "metallb.universe.tf/loadBalancerIPs: 192.168.10.3", None);
        bad = bad.replace("type: LoadBalancer", "type: LoadBalancer\n  loadBalancerIP: 192.168.10.4");
        reconciler.reconcile(&snapshot(&[POOL_A, &bad])).await;
        assert!(ips_of(&reconciler, "bad").is_empty());
        assert!(board.report().failures["default/bad"].contains("loadBalancerIPs"));
    }

    #[tokio::test]
    async fn test_bgp_pool_routes() {
        let (mut reconciler, _) = reconciler();
        let advertisement = "
apiVersion: metallb.io/v1beta1
kind: BGPAdvertisement
metadata:
  name: aggregated
spec:
  aggregationLength: 24
  localPref: 300
  communities: [\"64512:7\"]
  ipAddressPools: [pool-a]
";
        let a = service("a", "", None);
        let b = service("b", "", None);
        reconciler.reconcile(&snapshot(&[POOL_A, advertisement, &a, &b])).await;

        let routes = reconciler.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].prefix, "192.168.10.0/24".parse::<IpNet>().unwrap());
        assert_eq!(routes[0].local_pref, Some(300));
        assert_eq!(routes[0].communities, vec![(64512 << 16) | 7]);

        reconciler.reconcile(&snapshot(&[POOL_A, advertisement])).await;
        assert!(reconciler.routes().is_empty());
    }

    #[tokio::test]
    async fn test_allocated_address_reaches_peer() {
        let (dialer, mut accepted) = DuplexDialer::channel();
        let board = StatusBoard::new();
        let speaker = Speaker::new("node-a", BTreeMap::new(), Arc::new(dialer))
            .with_status_callback(board.session_callback());
        let mut reconciler = Reconciler::new(speaker, board.clone());

        let advertisement = "
apiVersion: metallb.io/v1beta1
kind: BGPAdvertisement
metadata:
  name: hosts
spec: {}
";
        let peer = "
apiVersion: metallb.io/v1beta2
kind: BGPPeer
metadata:
  name: tor
spec:
  myASN: 64512
  peerASN: 64513
  peerAddress: 10.0.0.254
";
        let a = service("a", "", None);
        reconciler.reconcile(&snapshot(&[POOL_A, advertisement, peer, &a])).await;

        let conn = accepted.recv().await.unwrap();
        assert_eq!(conn.peer, "tor");
        let mut router = MockPeer::new(conn.stream);
        router.handshake(64513, 90, Ipv4Addr::new(10, 0, 0, 254)).await.unwrap();
        let update = router.next_update().await.unwrap();
        assert_eq!(update.announced(), vec!["192.168.10.1/32".parse::<IpNet>().unwrap()]);

        let report = board.report();
        assert_eq!(report.peers.len(), 1);
        assert_eq!(report.peers[0].name, "tor");

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_node_labels_from_snapshot_select_peers() {
        let (dialer, mut accepted) = DuplexDialer::channel();
        let board = StatusBoard::new();
        let labels = BTreeMap::from([("rack".to_string(), "a".to_string())]);
        let speaker = Speaker::new("node-a", labels.clone(), Arc::new(dialer));
        let mut reconciler = Reconciler::new(speaker, board.clone()).with_node("node-a", labels);

        let peer = "
apiVersion: metallb.io/v1beta2
kind: BGPPeer
metadata:
  name: tor-b
spec:
  myASN: 64512
  peerASN: 64513
  peerAddress: 10.0.0.254
  nodeSelectors:
    - matchLabels: {rack: b}
";
        let node = "
apiVersion: v1
kind: Node
metadata:
  name: node-a
  labels: {rack: b}
";
        reconciler.reconcile(&snapshot(&[POOL_A, peer])).await;
        assert!(board.report().peers.is_empty());
        assert!(accepted.try_recv().is_err());

        reconciler.reconcile(&snapshot(&[POOL_A, peer, node])).await;
        assert_eq!(board.report().peers.len(), 1);
        let conn = tokio::time::timeout(std::time::Duration::from_secs(10), accepted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.peer, "tor-b");

        // Without the Node document the configured labels apply again.
        reconciler.reconcile(&snapshot(&[POOL_A, peer])).await;
        assert!(board.report().peers.is_empty());

        reconciler.shutdown().await;
    }
}
