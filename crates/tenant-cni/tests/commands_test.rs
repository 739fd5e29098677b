//! ADD / DEL / CHECK against on-disk stores and the mock backend.

use net_backend::{BackendCall, MockNetworkBackend};
use std::net::Ipv4Addr;
use std::time::Duration;
use tenant_cni::{CniError, Invocation, Plugin, ResolvePolicy};
use tenant_ipam::{pod_key, NodeIpam, PodIndex, StoreConfig, TenantIpam};

const NETNS: &str = "/var/run/netns/cni-1";

fn args(container: &str, pod: &str) -> Invocation {
    Invocation {
        container_id: container.to_string(),
        netns: NETNS.to_string(),
        if_name: "eth0".to_string(),
        pod: (!pod.is_empty()).then(|| pod_key("default", pod)),
    }
}

fn fast() -> ResolvePolicy {
    ResolvePolicy {
        attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

/// Materializes tenant `acme` on 10.1.0.0/24 and records pod `web-0` in it.
fn setup(tmp: &tempfile::TempDir) -> StoreConfig {
    let config = StoreConfig::new(tmp.path());
    let node = NodeIpam::open(&config, "node-a").unwrap();
    node.initialize("192.168.0.10".parse().unwrap(), "10.1.0.0/23".parse().unwrap(), 24)
        .unwrap();
    let subnet = node.allocate_tenant_subnet("acme").unwrap();
    TenantIpam::open(&config, "acme")
        .unwrap()
        .materialize("default/acme", subnet, 42, 24, 1450)
        .unwrap();
    PodIndex::open(&config)
        .unwrap()
        .record_pod(&pod_key("default", "web-0"), "acme")
        .unwrap();
    config
}

#[tokio::test]
async fn test_add_allocates_and_attaches() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config.clone(), &backend).with_resolve_policy(fast());

    let result = plugin.add(&args("c1", "web-0")).await.unwrap();

    assert_eq!(result.address, "10.1.0.2/24".parse::<ipnet::Ipv4Net>().unwrap());
    assert_eq!(result.gateway, "10.1.0.1".parse::<Ipv4Addr>().unwrap());
    assert_eq!(result.host_if_name, "veth0a010002");
    assert_eq!(result.netns, NETNS);
    assert_eq!(backend.veth(NETNS, "eth0"), Some("10.1.0.2/24".parse().unwrap()));
    assert!(backend.has_link("br-acme"));
    assert!(backend.calls().contains(&BackendCall::EnsureBridge {
        name: "br-acme".to_string(),
        mtu: 1450,
        gateway: "10.1.0.1/24".parse().unwrap(),
    }));
}

#[tokio::test]
async fn test_add_is_idempotent_per_container() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config.clone(), &backend).with_resolve_policy(fast());

    let first = plugin.add(&args("c1", "web-0")).await.unwrap();
    let second = plugin.add(&args("c1", "web-0")).await.unwrap();

    assert_eq!(first.address, second.address);
    assert_eq!(backend.bridge_creations(), 1);
    let record = TenantIpam::open(&config, "acme").unwrap().record().unwrap().unwrap();
    assert_eq!(record.allocated_ips.len(), 1);
}

#[tokio::test]
async fn test_add_fails_when_pod_never_resolves() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config, &backend).with_resolve_policy(fast());

    let err = plugin
        .add(&args("c9", "stranger"))
        .await
        .unwrap_err();
    assert!(matches!(err, CniError::TenantNotResolved(ref pod) if pod == "default/stranger"));
    assert_eq!(err.code(), 11);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_add_waits_for_pod_index() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config.clone(), &backend).with_resolve_policy(ResolvePolicy {
        attempts: 50,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
    });

    let recorder = {
        let config = config.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            PodIndex::open(&config)
                .unwrap()
                .record_pod(&pod_key("default", "late-0"), "acme")
                .unwrap();
        })
    };

    let result = plugin.add(&args("c2", "late-0")).await.unwrap();
    recorder.await.unwrap();
    assert_eq!(result.address.addr(), "10.1.0.2".parse::<Ipv4Addr>().unwrap());
}

#[tokio::test]
async fn test_failed_attach_releases_address() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    backend.fail_on("attach_veth");
    let plugin = Plugin::new(config.clone(), &backend).with_resolve_policy(fast());

    assert!(plugin.add(&args("c1", "web-0")).await.is_err());

    let tenant = TenantIpam::open(&config, "acme").unwrap();
    assert_eq!(tenant.lookup("c1").unwrap(), None);
}

#[tokio::test]
async fn test_del_releases_and_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config.clone(), &backend).with_resolve_policy(fast());
    plugin.add(&args("c1", "web-0")).await.unwrap();

    plugin.del(&args("c1", "web-0")).await.unwrap();
    plugin.del(&args("c1", "web-0")).await.unwrap();

    assert_eq!(TenantIpam::open(&config, "acme").unwrap().lookup("c1").unwrap(), None);
    assert_eq!(
        PodIndex::open(&config).unwrap().resolve_tenant("default/web-0").unwrap(),
        None
    );
    assert_eq!(backend.veth(NETNS, "eth0"), None);
}

#[tokio::test]
async fn test_del_without_index_entry_scans_tenants() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config.clone(), &backend).with_resolve_policy(fast());
    plugin.add(&args("c1", "web-0")).await.unwrap();
    PodIndex::open(&config).unwrap().forget_pod("default/web-0").unwrap();

    let mut del = args("c1", "");
    del.netns.clear();
    assert_eq!(del.pod, None);
    plugin.del(&del).await.unwrap();

    assert_eq!(TenantIpam::open(&config, "acme").unwrap().lookup("c1").unwrap(), None);
}

#[tokio::test]
async fn test_check_verifies_interface_address() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config, &backend).with_resolve_policy(fast());
    plugin.add(&args("c1", "web-0")).await.unwrap();

    let ip = plugin.check(&args("c1", "web-0")).await.unwrap();
    assert_eq!(ip, "10.1.0.2".parse::<Ipv4Addr>().unwrap());

    let mut wrong_if = args("c1", "web-0");
    wrong_if.if_name = "eth1".to_string();
    assert!(matches!(
        plugin.check(&wrong_if).await,
        Err(CniError::InterfaceMismatch { .. })
    ));

    assert!(matches!(
        plugin.check(&args("c7", "web-0")).await,
        Err(CniError::NoAddress(_))
    ));
}

#[tokio::test]
async fn test_add_before_tenant_is_materialized_asks_for_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    PodIndex::open(&config)
        .unwrap()
        .record_pod(&pod_key("default", "early-0"), "newco")
        .unwrap();
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config, &backend).with_resolve_policy(fast());

    let err = plugin.add(&args("c3", "early-0")).await.unwrap_err();

    assert_eq!(err.code(), 11);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_failed_detach_keeps_address_allocated() {
    let tmp = tempfile::tempdir().unwrap();
    let config = setup(&tmp);
    let backend = MockNetworkBackend::new();
    let plugin = Plugin::new(config.clone(), &backend).with_resolve_policy(fast());
    plugin.add(&args("c1", "web-0")).await.unwrap();

    backend.fail_on("detach_veth");
    assert!(plugin.del(&args("c1", "web-0")).await.is_err());

    let tenant = TenantIpam::open(&config, "acme").unwrap();
    assert_eq!(tenant.lookup("c1").unwrap(), Some("10.1.0.2".parse().unwrap()));
    assert_eq!(
        PodIndex::open(&config).unwrap().resolve_tenant("default/web-0").unwrap().as_deref(),
        Some("acme")
    );

    backend.clear_failure("detach_veth");
    plugin.del(&args("c1", "web-0")).await.unwrap();
    assert_eq!(tenant.lookup("c1").unwrap(), None);
}
