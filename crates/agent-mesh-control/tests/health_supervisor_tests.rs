//! End-to-end probe-cycle tests for the health supervisor, with the
//! service health endpoint stubbed by wiremock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use agent_mesh_control::{HealthSupervisor, ServiceInstance, ServiceRegistry};
use agent_mesh_core::config::HealthConfig;
use agent_mesh_core::events::{
    EventFilter, EventKind, EventPayload, EventStore, ServiceStatus,
};

fn instance_for(server: &MockServer, name: &str, id: &str) -> ServiceInstance {
    let port = server.address().port();
    ServiceInstance {
        service_id: id.to_string(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        host: "127.0.0.1".to_string(),
        grpc_port: port.wrapping_add(1),
        health_port: port,
        metrics_port: port.wrapping_add(2),
        manifest: json!({
            "kind": "AOLAgent",
            "apiVersion": "mesh/v1",
            "metadata": { "name": name },
            "spec": {},
        }),
        tags: BTreeSet::new(),
        meta: HashMap::new(),
        status: ServiceStatus::Starting,
        last_heartbeat: Utc::now(),
    }
}

fn supervisor_for(store: &Arc<EventStore>) -> (Arc<ServiceRegistry>, HealthSupervisor) {
    let registry = Arc::new(ServiceRegistry::new(store.clone()));
    let config = HealthConfig {
        check_interval: Duration::from_secs(30),
        probe_timeout: Duration::from_secs(2),
        heartbeat_ttl: Duration::from_secs(3600),
    };
    let supervisor = HealthSupervisor::new(registry.clone(), store.clone(), config);
    (registry, supervisor)
}

#[tokio::test]
async fn registration_and_probe_cycle_promotes_to_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;

    let store = Arc::new(EventStore::new(1000));
    let (registry, supervisor) = supervisor_for(&store);

    registry
        .register(instance_for(&server, "svc-a", "i1"))
        .await
        .unwrap();
    assert!(registry.get_healthy("svc-a").await.is_none());

    supervisor.sweep().await;

    let healthy = registry.get_healthy("svc-a").await.unwrap();
    assert_eq!(healthy.service_id, "i1");

    let transitions = store
        .get_events(EventFilter {
            kind: Some(EventKind::HealthChanged),
            ..Default::default()
        })
        .await;
    assert_eq!(transitions.len(), 1);
    match &transitions[0].payload {
        EventPayload::HealthChanged {
            old_status,
            new_status,
            ..
        } => {
            assert_eq!(*old_status, ServiceStatus::Starting);
            assert_eq!(*new_status, ServiceStatus::Healthy);
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[tokio::test]
async fn health_flap_emits_both_transitions_in_order() {
    let server = MockServer::start().await;
    // One 200 (starting -> healthy), one 500 (healthy -> unhealthy), then
    // 200 again (unhealthy -> healthy).
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(EventStore::new(1000));
    let (registry, supervisor) = supervisor_for(&store);
    registry
        .register(instance_for(&server, "svc-a", "i1"))
        .await
        .unwrap();

    supervisor.sweep().await; // -> healthy
    supervisor.sweep().await; // -> unhealthy
    supervisor.sweep().await; // -> healthy again

    let transitions = store
        .get_events(EventFilter {
            kind: Some(EventKind::HealthChanged),
            ..Default::default()
        })
        .await;
    let observed: Vec<(ServiceStatus, ServiceStatus)> = transitions
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::HealthChanged {
                old_status,
                new_status,
                ..
            } => Some((*old_status, *new_status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        observed,
        vec![
            (ServiceStatus::Starting, ServiceStatus::Healthy),
            (ServiceStatus::Healthy, ServiceStatus::Unhealthy),
            (ServiceStatus::Unhealthy, ServiceStatus::Healthy),
        ]
    );
    // Membership never changed.
    assert_eq!(registry.list_all().await["svc-a"].len(), 1);
}

#[tokio::test]
async fn starting_instance_gets_one_grace_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = Arc::new(EventStore::new(1000));
    let (registry, supervisor) = supervisor_for(&store);
    registry
        .register(instance_for(&server, "svc-a", "i1"))
        .await
        .unwrap();

    // First failing probe after registration: still starting.
    supervisor.sweep().await;
    let after_first = registry.get("svc-a", "i1").await.unwrap();
    assert_eq!(after_first.status, ServiceStatus::Starting);

    // Second failure exhausts the grace and marks it unhealthy.
    supervisor.sweep().await;
    let after_second = registry.get("svc-a", "i1").await.unwrap();
    assert_eq!(after_second.status, ServiceStatus::Unhealthy);
}

#[tokio::test]
async fn unreachable_endpoint_is_unhealthy_after_grace() {
    // No mock server: connection refused.
    let store = Arc::new(EventStore::new(1000));
    let (registry, supervisor) = supervisor_for(&store);
    let mut instance = ServiceInstance {
        service_id: "i1".to_string(),
        name: "svc-a".to_string(),
        version: "1.0.0".to_string(),
        host: "127.0.0.1".to_string(),
        grpc_port: 59901,
        health_port: 59902,
        metrics_port: 59903,
        manifest: json!({
            "kind": "AOLAgent",
            "apiVersion": "mesh/v1",
            "metadata": { "name": "svc-a" },
            "spec": {},
        }),
        tags: BTreeSet::new(),
        meta: HashMap::new(),
        status: ServiceStatus::Starting,
        last_heartbeat: Utc::now(),
    };
    instance.health_port = 1; // nothing listens here
    registry.register(instance).await.unwrap();

    supervisor.sweep().await;
    supervisor.sweep().await;
    let current = registry.get("svc-a", "i1").await.unwrap();
    assert_eq!(current.status, ServiceStatus::Unhealthy);
}

#[tokio::test]
async fn reconcile_adopts_and_removes_instances() {
    use agent_mesh_control::RemoteInstance;

    let store = Arc::new(EventStore::new(1000));
    let (registry, supervisor) = supervisor_for(&store);

    // Locally-known instance the provider no longer reports.
    let server = MockServer::start().await;
    registry
        .register(instance_for(&server, "svc-a", "local-1"))
        .await
        .unwrap();

    let remote = vec![RemoteInstance {
        service_id: "remote-1".to_string(),
        name: "svc-a".to_string(),
        host: "10.0.0.7".to_string(),
        port: 50051,
        tags: vec![],
        meta: HashMap::new(),
    }];
    supervisor.reconcile_membership("svc-a", remote).await;

    let instances = registry.instances("svc-a").await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].service_id, "remote-1");
    assert_eq!(instances[0].status, ServiceStatus::Starting);

    let discovered = store
        .get_events(EventFilter {
            kind: Some(EventKind::ServiceDiscovered),
            ..Default::default()
        })
        .await;
    assert_eq!(discovered.len(), 1);
}
