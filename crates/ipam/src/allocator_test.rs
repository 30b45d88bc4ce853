//! Unit tests for the address allocator

#[cfg(test)]
mod tests {
    use crate::{
        AllocationError, AllocationRequest, Allocator, FamilyPolicy, PoolConfig, Pools, Port,
        Protocol, ServiceId,
    };
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn svc(name: &str) -> ServiceId {
        ServiceId::new("default", name)
    }

    fn pools(configs: Vec<PoolConfig>) -> Pools {
        Pools::from_configs(&configs).unwrap()
    }

    fn allocator(configs: Vec<PoolConfig>) -> Allocator {
        Allocator::new(pools(configs))
    }

    fn buggy_pool_a() -> PoolConfig {
        let mut config = PoolConfig::new("pool-a", &["192.168.10.0/24"]);
        config.avoid_buggy_ips = true;
        config
    }

    #[test]
    fn test_pool_a_scenario_hands_out_addresses_in_order() {
        let mut alloc = allocator(vec![buggy_pool_a()]);
        for n in 1..=254u16 {
            let ips = alloc
                .assign(&svc(&format!("s{n}")), &AllocationRequest::default())
                .unwrap();
            assert_eq!(ips, vec![ip(&format!("192.168.10.{n}"))]);
        }
        assert_eq!(
            alloc.assign(&svc("s255"), &AllocationRequest::default()),
            Err(AllocationError::PoolExhausted("pool-a".to_string()))
        );
        assert_eq!(
            alloc.assign(&svc("s255"), &AllocationRequest::from_pool("pool-a")),
            Err(AllocationError::PoolExhausted("pool-a".to_string()))
        );
    }

    #[test]
    fn test_exhaustion_after_size_requests() {
        let config = PoolConfig::new("small", &["10.0.0.0/29"]);
        let mut alloc = allocator(vec![config]);
        let (size, _) = alloc.pools().get("small").unwrap().size();
        assert_eq!(size, 7);
        for n in 0..size {
            alloc
                .assign(&svc(&format!("s{n}")), &AllocationRequest::from_pool("small"))
                .unwrap();
        }
        assert_eq!(
            alloc.assign(&svc("last"), &AllocationRequest::from_pool("small")),
            Err(AllocationError::PoolExhausted("small".to_string()))
        );
    }

    #[test]
    fn test_avoid_buggy_ips_never_returned() {
        let mut config = PoolConfig::new("p", &["10.0.0.250-10.0.1.5"]);
        config.avoid_buggy_ips = true;
        let mut alloc = allocator(vec![config]);
        let mut seen = Vec::new();
        for n in 0..20 {
            match alloc.assign(&svc(&format!("s{n}")), &AllocationRequest::default()) {
                Ok(ips) => seen.extend(ips),
                Err(e) => {
                    assert_eq!(e, AllocationError::PoolExhausted("p".to_string()));
                    break;
                }
            }
        }
        assert_eq!(seen.len(), 10);
        assert!(!seen.contains(&ip("10.0.0.255")));
        assert!(!seen.contains(&ip("10.0.1.0")));
    }

    #[test]
    fn test_same_inputs_same_outputs() {
        let run = || {
            let mut alloc = allocator(vec![
                PoolConfig::new("a", &["10.0.0.0/30"]),
                PoolConfig::new("b", &["10.0.1.0/30"]),
            ]);
            (0..6)
                .map(|n| alloc.assign(&svc(&format!("s{n}")), &AllocationRequest::default()))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_auto_assign_follows_declaration_order() {
        let mut alloc = allocator(vec![
            PoolConfig::new("z-first", &["10.0.9.0/31"]),
            PoolConfig::new("a-second", &["10.0.1.0/24"]),
        ]);
        assert_eq!(
            alloc.assign(&svc("one"), &AllocationRequest::default()).unwrap(),
            vec![ip("10.0.9.1")]
        );
        assert_eq!(
            alloc.assign(&svc("two"), &AllocationRequest::default()).unwrap(),
            vec![ip("10.0.1.1")]
        );
    }

    #[test]
    fn test_auto_assign_skips_reserved_pools() {
        let mut reserved = PoolConfig::new("reserved", &["10.0.0.0/24"]);
        reserved.auto_assign = false;
        let mut alloc = allocator(vec![reserved.clone()]);
        assert_eq!(
            alloc.assign(&svc("a"), &AllocationRequest::default()),
            Err(AllocationError::NoEligiblePool)
        );
        assert_eq!(
            alloc.assign(&svc("a"), &AllocationRequest::from_pool("reserved")).unwrap(),
            vec![ip("10.0.0.1")]
        );
        assert_eq!(
            alloc
                .assign(&svc("b"), &AllocationRequest::for_addresses(vec![ip("10.0.0.9")]))
                .unwrap(),
            vec![ip("10.0.0.9")]
        );
    }

    #[test]
    fn test_all_pools_exhausted() {
        let mut alloc = allocator(vec![
            PoolConfig::new("a", &["10.0.0.1/32"]),
            PoolConfig::new("b", &["10.0.1.1/32"]),
        ]);
        alloc.assign(&svc("x"), &AllocationRequest::default()).unwrap();
        alloc.assign(&svc("y"), &AllocationRequest::default()).unwrap();
        assert_eq!(
            alloc.assign(&svc("z"), &AllocationRequest::default()),
            Err(AllocationError::AllPoolsExhausted)
        );
    }

    #[test]
    fn test_unknown_pool() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        assert_eq!(
            alloc.assign(&svc("s"), &AllocationRequest::from_pool("nope")),
            Err(AllocationError::UnknownPool("nope".to_string()))
        );
    }

    #[test]
    fn test_explicit_address_errors() {
        let mut alloc = allocator(vec![
            PoolConfig::new("a", &["10.0.0.0/24"]),
            PoolConfig::new("b", &["10.0.1.0/24"]),
        ]);
        assert_eq!(
            alloc.assign(&svc("s"), &AllocationRequest::for_addresses(vec![ip("192.0.2.1")])),
            Err(AllocationError::AddressNotInAnyPool(ip("192.0.2.1")))
        );
        // Network address of a CIDR is not usable.
        assert_eq!(
            alloc.assign(&svc("s"), &AllocationRequest::for_addresses(vec![ip("10.0.0.0")])),
            Err(AllocationError::AddressNotInAnyPool(ip("10.0.0.0")))
        );

        let mut request = AllocationRequest::for_addresses(vec![ip("10.0.1.5")]);
        request.pool = Some("a".to_string());
        assert_eq!(
            alloc.assign(&svc("s"), &request),
            Err(AllocationError::AddressNotInRequestedPool {
                ip: ip("10.0.1.5"),
                pool: "a".to_string()
            })
        );

        alloc
            .assign(&svc("owner"), &AllocationRequest::for_addresses(vec![ip("10.0.0.5")]))
            .unwrap();
        assert_eq!(
            alloc.assign(&svc("s"), &AllocationRequest::for_addresses(vec![ip("10.0.0.5")])),
            Err(AllocationError::AddressInUse {
                ip: ip("10.0.0.5"),
                owner: "default/owner".to_string()
            })
        );
    }

    #[test]
    fn test_request_shape_errors() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        assert!(matches!(
            alloc.assign(
                &svc("s"),
                &AllocationRequest::for_addresses(vec![ip("10.0.0.1"), ip("10.0.0.2")])
            ),
            Err(AllocationError::TooManyAddresses(_))
        ));
        let request = AllocationRequest::for_addresses(vec![ip("10.0.0.1")])
            .with_families(FamilyPolicy::DualStack);
        assert!(matches!(
            alloc.assign(&svc("s"), &request),
            Err(AllocationError::FamilyMismatch { .. })
        ));
    }

    #[test]
    fn test_no_double_allocation_without_sharing_key() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        let a = alloc.assign(&svc("a"), &AllocationRequest::default()).unwrap();
        let b = alloc.assign(&svc("b"), &AllocationRequest::default()).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.owners(&a[0]).len(), 1);
    }

    #[test]
    fn test_sharing_with_disjoint_ports() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        let web = AllocationRequest::default()
            .with_sharing_key("shared")
            .with_ports(vec![Port::tcp(80)]);
        let dns = AllocationRequest::default()
            .with_sharing_key("shared")
            .with_ports(vec![Port::udp(53)]);
        let a = alloc.assign(&svc("web"), &web).unwrap();
        let b = alloc.assign(&svc("dns"), &dns).unwrap();
        assert_eq!(a, b);
        assert_eq!(alloc.owners(&a[0]).len(), 2);
    }

    #[test]
    fn test_sharing_refused_on_conflicts() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        let base = AllocationRequest::for_addresses(vec![ip("10.0.0.10")])
            .with_sharing_key("k")
            .with_backend_key("app=web")
            .with_ports(vec![Port::tcp(80)]);
        alloc.assign(&svc("first"), &base).unwrap();

        let same_port = base.clone();
        let other_key = base.clone().with_sharing_key("other").with_ports(vec![Port::tcp(81)]);
        let other_backend = base.clone().with_backend_key("app=db").with_ports(vec![Port::tcp(81)]);
        let no_key = base.clone().with_sharing_key("").with_ports(vec![Port::tcp(81)]);
        for request in [same_port, other_key, other_backend, no_key] {
            assert!(matches!(
                alloc.assign(&svc("second"), &request),
                Err(AllocationError::AddressInUse { .. })
            ));
        }

        let ok = base.with_ports(vec![Port::tcp(443)]);
        assert_eq!(alloc.assign(&svc("second"), &ok).unwrap(), vec![ip("10.0.0.10")]);
    }

    #[test]
    fn test_auto_allocation_joins_compatible_owner() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        alloc.assign(&svc("plain"), &AllocationRequest::default()).unwrap();
        let shared = AllocationRequest::default()
            .with_sharing_key("k")
            .with_ports(vec![Port::tcp(80)]);
        let first = alloc.assign(&svc("s1"), &shared).unwrap();
        assert_eq!(first, vec![ip("10.0.0.2")]);
        let second = alloc
            .assign(&svc("s2"), &shared.clone().with_ports(vec![Port::tcp(443)]))
            .unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn test_assign_is_idempotent() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        let first = alloc.assign(&svc("s"), &AllocationRequest::default()).unwrap();
        let again = alloc.assign(&svc("s"), &AllocationRequest::default()).unwrap();
        assert_eq!(first, again);
        assert_eq!(alloc.allocations().len(), 1);
    }

    #[test]
    fn test_changed_request_moves_allocation() {
        let mut alloc = allocator(vec![
            PoolConfig::new("a", &["10.0.0.0/24"]),
            PoolConfig::new("b", &["10.0.1.0/24"]),
        ]);
        alloc.assign(&svc("s"), &AllocationRequest::default()).unwrap();
        let moved = alloc.assign(&svc("s"), &AllocationRequest::from_pool("b")).unwrap();
        assert_eq!(moved, vec![ip("10.0.1.1")]);
        assert!(alloc.owners(&ip("10.0.0.1")).is_empty());
    }

    #[test]
    fn test_failed_reassign_keeps_previous_allocation() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        let held = alloc.assign(&svc("s"), &AllocationRequest::default()).unwrap();
        assert!(alloc.assign(&svc("s"), &AllocationRequest::from_pool("missing")).is_err());
        assert_eq!(alloc.allocation(&svc("s")).unwrap().ips(), held);
        assert_eq!(alloc.owners(&held[0]), vec![&svc("s")]);
    }

    #[test]
    fn test_sharing_key_change_rechecked() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/24"])]);
        let shared = AllocationRequest::for_addresses(vec![ip("10.0.0.3")])
            .with_sharing_key("k")
            .with_ports(vec![Port::tcp(80)]);
        alloc.assign(&svc("a"), &shared).unwrap();
        alloc
            .assign(&svc("b"), &shared.clone().with_ports(vec![Port::tcp(81)]))
            .unwrap();
        let changed = shared.with_sharing_key("different");
        assert!(matches!(
            alloc.assign(&svc("a"), &changed),
            Err(AllocationError::AddressInUse { .. })
        ));
        assert_eq!(alloc.allocation(&svc("a")).unwrap().sharing_key, "k");
    }

    #[test]
    fn test_unassign_frees_address() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.1/32"])]);
        let ips = alloc.assign(&svc("a"), &AllocationRequest::default()).unwrap();
        assert!(alloc.assign(&svc("b"), &AllocationRequest::default()).is_err());
        let released = alloc.unassign(&svc("a")).unwrap();
        assert_eq!(released.ips(), ips);
        assert!(alloc.unassign(&svc("a")).is_none());
        assert_eq!(alloc.assign(&svc("b"), &AllocationRequest::default()).unwrap(), ips);
    }

    #[test]
    fn test_dual_stack() {
        let mut alloc = allocator(vec![
            PoolConfig::new("v4only", &["10.0.0.0/24"]),
            PoolConfig::new("dual", &["fd00::/120", "10.0.5.0/24"]),
        ]);
        let request = AllocationRequest::default().with_families(FamilyPolicy::DualStack);
        assert_eq!(
            alloc.assign(&svc("s"), &request).unwrap(),
            vec![ip("10.0.5.1"), ip("fd00::1")]
        );
        let v6 = AllocationRequest::default().with_families(FamilyPolicy::V6);
        assert_eq!(alloc.assign(&svc("t"), &v6).unwrap(), vec![ip("fd00::2")]);
    }

    #[test]
    fn test_set_pools_drops_uncovered_allocations() {
        let mut alloc = allocator(vec![
            PoolConfig::new("a", &["10.0.0.0/24"]),
            PoolConfig::new("b", &["10.0.1.0/24"]),
        ]);
        alloc.assign(&svc("in-a"), &AllocationRequest::from_pool("a")).unwrap();
        alloc.assign(&svc("in-b"), &AllocationRequest::from_pool("b")).unwrap();

        let stale = alloc.set_pools(pools(vec![PoolConfig::new("renamed", &["10.0.0.0/24"])]));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].allocation.service, svc("in-b"));
        assert_eq!(stale[0].ip, ip("10.0.1.1"));
        assert!(alloc.allocation(&svc("in-b")).is_none());
        assert_eq!(alloc.allocation(&svc("in-a")).unwrap().addresses[0].pool, "renamed");
    }

    #[test]
    fn test_set_pools_drops_newly_buggy_address() {
        let mut alloc = allocator(vec![PoolConfig::new("a", &["10.0.0.0/23"])]);
        alloc
            .assign(&svc("s"), &AllocationRequest::for_addresses(vec![ip("10.0.0.255")]))
            .unwrap();
        let mut config = PoolConfig::new("a", &["10.0.0.0/23"]);
        config.avoid_buggy_ips = true;
        let stale = alloc.set_pools(pools(vec![config]));
        assert_eq!(stale.len(), 1);
    }

    #[test]
    fn test_pool_stats() {
        let mut bgp = PoolConfig::new("a", &["10.0.0.0/24"]);
        bgp.protocol = Protocol::Bgp;
        let mut alloc = allocator(vec![bgp]);
        let shared = AllocationRequest::default().with_sharing_key("k");
        alloc.assign(&svc("x"), &shared.clone().with_ports(vec![Port::tcp(1)])).unwrap();
        alloc.assign(&svc("y"), &shared.with_ports(vec![Port::tcp(2)])).unwrap();
        alloc.assign(&svc("z"), &AllocationRequest::default()).unwrap();
        let stats = alloc.pool_stats("a").unwrap();
        assert_eq!(stats.capacity_v4, 255);
        assert_eq!(stats.in_use_v4, 2);
        assert_eq!(stats.in_use_v6, 0);
        assert_eq!(stats.services, 3);
        assert!(alloc.pool_stats("missing").is_none());
    }
}
