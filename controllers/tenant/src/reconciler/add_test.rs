//! Unit tests for the Tenant Add reconciler

#[cfg(test)]
mod tests {
    use crate::cluster::EventSeverity;
    use crate::queue::TenantEvent;
    use crate::reconciler::TenantState;
    use crate::test_utils::*;
    use crds::{node_tenant_annotation, DEFAULT_TENANT};
    use ipnet::Ipv4Net;
    use net_backend::NeighborKind;
    use std::net::Ipv4Addr;
    use tenant_ipam::TenantIpam;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    async fn add(harness: &TestHarness, name: &str, vni: u32, nodes: &[&str]) {
        let tenant = harness.cluster.put_tenant(create_test_tenant(name, vni, 24, nodes));
        harness
            .reconciler
            .reconcile(&TenantEvent::Add(tenant))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_materializes_single_node_tenant() {
        let harness = TestHarness::new("10.1.0.0/23");
        add(&harness, "acme", 42, &["node-a"]).await;

        let record = TenantIpam::open_existing(&harness.config.store, "acme")
            .unwrap()
            .record()
            .unwrap()
            .unwrap();
        assert_eq!(record.tenant_cidr, net("10.1.0.0/24"));
        assert_eq!(record.bridge.name, "br-acme");
        assert_eq!(record.bridge.mtu, 1450);
        assert_eq!(record.vxlan.vni, 42);
        assert_eq!(harness.node_ipam().tenant_subnet("acme").unwrap(), Some(net("10.1.0.0/24")));

        assert!(harness.backend.has_link("br-acme"));
        assert_eq!(harness.backend.vxlan_creations(), 0, "single-node tenants stay local");
        assert!(harness.backend.is_forwarded(net("10.1.0.0/24")));
        assert_eq!(
            harness.reconciler.local_state("acme").await.unwrap(),
            TenantState::LocalOnly
        );

        let published = harness.cluster.tenant("acme").unwrap();
        let entry = published.spec.node("node-a").unwrap();
        assert_eq!(entry.vtep_ip.as_deref(), Some("10.1.0.1"));
        assert_eq!(entry.node_ip.as_deref(), Some("192.168.0.10"));
        assert_eq!(entry.vtep_mac.as_deref(), Some(record.vxlan.vtep_mac.as_str()));

        assert_eq!(
            harness.cluster.annotation("node-a", &node_tenant_annotation("acme")),
            Some("10.1.0.0/24".to_string())
        );
        let events = harness.cluster.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, EventSeverity::Normal);
        assert_eq!(events[0].reason, "Add");
        assert_eq!(events[0].note, "Tenant has been created on node: node-a");
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let harness = TestHarness::new("10.1.0.0/23");
        let tenant = harness.cluster.put_tenant(create_test_tenant("acme", 42, 24, &["node-a"]));

        harness
            .reconciler
            .reconcile(&TenantEvent::Add(tenant.clone()))
            .await
            .unwrap();
        let first = TenantIpam::open(&harness.config.store, "acme").unwrap().record().unwrap();

        harness
            .reconciler
            .reconcile(&TenantEvent::Add(tenant))
            .await
            .unwrap();
        let second = TenantIpam::open(&harness.config.store, "acme").unwrap().record().unwrap();

        assert_eq!(first, second);
        assert_eq!(harness.backend.bridge_creations(), 1);
        assert_eq!(
            harness.node_ipam().record().unwrap().available_subnets,
            vec![net("10.1.1.0/24")]
        );
    }

    #[tokio::test]
    async fn test_add_rejects_prefix_other_than_node_subnets() {
        let harness = TestHarness::new("10.1.0.0/23");
        let tenant = harness.cluster.put_tenant(create_test_tenant("acme", 42, 26, &["node-a"]));

        harness.reconciler.reconcile(&TenantEvent::Add(tenant)).await.unwrap();

        assert!(TenantIpam::open_existing(&harness.config.store, "acme").is_err());
        assert_eq!(harness.node_ipam().tenant_subnet("acme").unwrap(), None);
        assert!(!harness.backend.has_link("br-acme"));
        let events = harness.cluster.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, EventSeverity::Warning);
        assert_eq!(events[0].reason, "InvalidPrefix");
    }

    #[tokio::test]
    async fn test_add_rejects_name_held_by_another_namespace() {
        let harness = TestHarness::new("10.1.0.0/23");
        add(&harness, "acme", 42, &["node-a"]).await;

        let mut rival = create_test_tenant("acme", 43, 24, &["node-a"]);
        rival.metadata.namespace = Some("tenants".to_string());
        let rival = harness.cluster.put_tenant(rival);
        harness.reconciler.reconcile(&TenantEvent::Add(rival)).await.unwrap();

        let record = TenantIpam::open_existing(&harness.config.store, "acme")
            .unwrap()
            .record()
            .unwrap()
            .unwrap();
        assert_eq!(record.owner.as_deref(), Some("default/acme"));
        assert_eq!(record.vxlan.vni, 42);
        let conflict = harness.cluster.events().into_iter().last().unwrap();
        assert_eq!(conflict.severity, EventSeverity::Warning);
        assert_eq!(conflict.reason, "NameConflict");
        assert!(conflict.note.contains("default/acme"));
    }

    #[tokio::test]
    async fn test_add_ignores_tenants_on_other_nodes() {
        let harness = TestHarness::new("10.1.0.0/23");
        add(&harness, "acme", 42, &["node-b"]).await;

        assert!(harness.backend.calls().is_empty());
        assert_eq!(harness.node_ipam().tenant_subnet("acme").unwrap(), None);
        assert!(harness.cluster.events().is_empty());
    }

    #[tokio::test]
    async fn test_add_isolates_tenants_but_not_default() {
        let harness = TestHarness::new("10.1.0.0/22");
        add(&harness, DEFAULT_TENANT, 1, &["node-a"]).await;
        add(&harness, "acme", 42, &["node-a"]).await;
        add(&harness, "globex", 43, &["node-a"]).await;

        let default = net("10.1.0.0/24");
        let acme = net("10.1.1.0/24");
        let globex = net("10.1.2.0/24");
        assert!(harness.backend.is_isolated(acme, globex));
        assert!(!harness.backend.is_isolated(default, acme));
        assert!(!harness.backend.is_isolated(default, globex));
        for subnet in [default, acme, globex] {
            assert!(harness.backend.is_forwarded(subnet));
        }
    }

    #[tokio::test]
    async fn test_add_meshes_with_published_peers() {
        let harness = TestHarness::new("10.1.0.0/23");
        let mut tenant = create_test_tenant("acme", 42, 24, &["node-a"]);
        tenant
            .spec
            .nodes
            .push(published_node("node-b", "10.2.0.1", "02:00:00:00:00:0B", "192.168.0.11"));
        tenant.spec.nodes.push(crds::TenantNode::new("node-c"));
        let tenant = harness.cluster.put_tenant(tenant);

        harness
            .reconciler
            .reconcile(&TenantEvent::Add(tenant))
            .await
            .unwrap();

        assert_eq!(harness.backend.vxlan_creations(), 1);
        assert!(harness.backend.has_link("acme.42"));
        assert_eq!(
            harness.reconciler.local_state("acme").await.unwrap(),
            TenantState::Meshed
        );

        let neighbors = harness.backend.neighbors();
        let mac = "02:00:00:00:00:0b".to_string();
        assert!(neighbors.contains(&("acme.42".to_string(), ip("10.2.0.1"), mac.clone(), NeighborKind::Arp)));
        assert!(neighbors.contains(&("acme.42".to_string(), ip("192.168.0.11"), mac, NeighborKind::Fdb)));
        assert_eq!(neighbors.len(), 2, "node-c has not published yet");

        let routes = harness.backend.routes();
        assert!(routes.contains(&("acme.42".to_string(), net("10.2.0.1/32"), None)));
        assert!(routes.contains(&("acme.42".to_string(), net("10.2.0.0/24"), Some(ip("10.2.0.1")))));
    }

    #[tokio::test]
    async fn test_add_retries_vtep_publication_on_conflict() {
        let harness = TestHarness::new("10.1.0.0/23");
        harness.cluster.inject_conflicts(2);
        add(&harness, "acme", 42, &["node-a"]).await;

        assert_eq!(harness.cluster.replace_attempts(), 3);
        let published = harness.cluster.tenant("acme").unwrap();
        assert!(published.spec.node("node-a").unwrap().is_published());
    }

    #[tokio::test]
    async fn test_add_gives_up_after_repeated_conflicts() {
        let harness = TestHarness::new("10.1.0.0/23");
        harness.cluster.inject_conflicts(10);
        let tenant = harness.cluster.put_tenant(create_test_tenant("acme", 42, 24, &["node-a"]));

        let err = harness
            .reconciler
            .reconcile(&TenantEvent::Add(tenant))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(harness.cluster.replace_attempts(), harness.config.conflict_retries);
    }

    #[tokio::test]
    async fn test_add_of_vanished_tenant_stops_after_bridge() {
        let harness = TestHarness::new("10.1.0.0/23");
        let tenant = create_test_tenant("acme", 42, 24, &["node-a"]);

        harness
            .reconciler
            .reconcile(&TenantEvent::Add(tenant))
            .await
            .unwrap();

        assert!(harness.backend.has_link("br-acme"));
        assert_eq!(harness.cluster.annotation("node-a", &node_tenant_annotation("acme")), None);
        assert!(harness.cluster.events().is_empty());
    }
}
