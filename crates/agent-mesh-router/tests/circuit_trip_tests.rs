//! Circuit-trip scenario: five consecutive failures open an instance's
//! circuit, routing moves to the surviving instance, and after the open
//! timeout the recovered instance closes its circuit with three
//! consecutive successes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::json;

use agent_mesh_control::{ServiceInstance, ServiceRegistry};
use agent_mesh_core::config::{CircuitBreakerConfig, RouterConfig};
use agent_mesh_core::error::RetryPolicy;
use agent_mesh_core::events::{EventStore, ServiceStatus};
use agent_mesh_router::testing::ScriptedTransport;
use agent_mesh_router::{CircuitState, Router, RouteSubmission, RoutingStrategy};

fn instance(name: &str, id: &str, host: &str, port: u16) -> ServiceInstance {
    ServiceInstance {
        service_id: id.to_string(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        host: host.to_string(),
        grpc_port: port,
        health_port: port + 1,
        metrics_port: port + 2,
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

fn submission() -> RouteSubmission {
    RouteSubmission {
        timeout: Duration::from_secs(5),
        strategy: RoutingStrategy::RoundRobin,
        ..RouteSubmission::new("svc-a", "svc-b", "Process", Bytes::from_static(b"{}"))
    }
}

#[tokio::test]
async fn circuit_trips_after_five_failures_and_recloses_after_three_successes() {
    let transport = Arc::new(ScriptedTransport::default());
    // The first instance fails its first five calls, then recovers.
    transport.fail_first("h1:50051", 5);

    let store = Arc::new(EventStore::new(1000));
    let registry = Arc::new(ServiceRegistry::new(store.clone()));
    let router = Router::new(
        registry.clone(),
        store,
        transport,
        RouterConfig {
            workers: 1,
            queue_capacity: 64,
        },
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_millis(200),
        },
        // No retries: each route is exactly one attempt.
        RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
        },
    );
    router.start().await;

    registry
        .register(instance("svc-b", "i1", "h1", 50051))
        .await
        .unwrap();
    registry
        .register(instance("svc-b", "i2", "h2", 50051))
        .await
        .unwrap();
    // Only the first instance is healthy while we trip its breaker.
    registry
        .update_health("svc-b", "i1", ServiceStatus::Healthy)
        .await
        .unwrap();

    for attempt in 0..5 {
        let response = router.route(submission()).await.unwrap();
        assert!(!response.success, "attempt {} should fail", attempt);
        assert_eq!(response.target_instance, "h1:50051");
    }
    assert_eq!(
        router.balancer().circuit_state("h1:50051").await,
        Some(CircuitState::Open)
    );

    // With the second instance healthy, the sixth request must land on it
    // on the first try.
    registry
        .update_health("svc-b", "i2", ServiceStatus::Healthy)
        .await
        .unwrap();
    let sixth = router.route(submission()).await.unwrap();
    assert!(sixth.success);
    assert_eq!(sixth.target_instance, "h2:50051");
    assert_eq!(sixth.retries_used, 0);

    // Let the open timeout elapse, then force traffic back to the first
    // instance; three consecutive successes close its circuit.
    tokio::time::sleep(Duration::from_millis(250)).await;
    registry
        .update_health("svc-b", "i2", ServiceStatus::Unhealthy)
        .await
        .unwrap();

    for _ in 0..3 {
        let response = router.route(submission()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.target_instance, "h1:50051");
    }
    assert_eq!(
        router.balancer().circuit_state("h1:50051").await,
        Some(CircuitState::Closed)
    );

    router.stop().await;
}
