//! Concurrent allocation against shared on-disk records.
//!
//! Every thread opens its own handle, so the only thing serializing them is
//! the advisory file lock, exactly as for independent CNI processes.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use tenant_ipam::{NodeIpam, StoreConfig, TenantIpam};

#[test]
fn test_concurrent_ip_allocation_never_double_allocates() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(StoreConfig::new(tmp.path()));
    TenantIpam::open(&config, "acme")
        .unwrap()
        .materialize("default/acme", "10.1.0.0/24".parse().unwrap(), 42, 24, 1450)
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let config = Arc::clone(&config);
            thread::spawn(move || {
                let ipam = TenantIpam::open(&config, "acme").unwrap();
                (0..20)
                    .map(|i| ipam.allocate_ip(&format!("c-{worker}-{i}"), "eth0").unwrap())
                    .collect::<Vec<Ipv4Addr>>()
            })
        })
        .collect();

    let all: Vec<Ipv4Addr> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 160);
    assert_eq!(unique.len(), 160);
    assert!(!unique.contains(&"10.1.0.1".parse::<Ipv4Addr>().unwrap()));

    let record = TenantIpam::open(&config, "acme").unwrap().record().unwrap().unwrap();
    assert_eq!(record.allocated_ips.len(), 160);
}

#[test]
fn test_concurrent_allocate_and_release_keeps_record_consistent() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(StoreConfig::new(tmp.path()));
    TenantIpam::open(&config, "acme")
        .unwrap()
        .materialize("default/acme", "10.2.0.0/28".parse().unwrap(), 7, 28, 1450)
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let config = Arc::clone(&config);
            thread::spawn(move || {
                let ipam = TenantIpam::open(&config, "acme").unwrap();
                for i in 0..25 {
                    let id = format!("c-{worker}-{i}");
                    ipam.allocate_ip(&id, "eth0").unwrap();
                    assert!(ipam.release_ip(&id).unwrap().is_some());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let record = TenantIpam::open(&config, "acme").unwrap().record().unwrap().unwrap();
    assert!(record.allocated_ips.is_empty());
}

#[test]
fn test_concurrent_subnet_allocation_is_unique() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(StoreConfig::new(tmp.path()));
    NodeIpam::open(&config, "node-a")
        .unwrap()
        .initialize("192.168.0.10".parse().unwrap(), "10.0.0.0/16".parse().unwrap(), 24)
        .unwrap();

    let handles: Vec<_> = (0..16)
        .map(|worker| {
            let config = Arc::clone(&config);
            thread::spawn(move || {
                let node = NodeIpam::open(&config, "node-a").unwrap();
                node.allocate_tenant_subnet(&format!("tenant-{worker}")).unwrap()
            })
        })
        .collect();

    let subnets: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(subnets.len(), 16);

    let record = NodeIpam::open(&config, "node-a").unwrap().record().unwrap();
    assert_eq!(record.available_subnets.len(), 240);
    assert!(record
        .available_subnets
        .iter()
        .all(|s| !record.tenant_subnets.values().any(|t| t == s)));
}
