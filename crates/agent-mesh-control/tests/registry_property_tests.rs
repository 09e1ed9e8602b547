//! Property tests for the registry invariants: every registered and
//! not-yet-deregistered instance shows up exactly once, and `get_healthy`
//! only ever hands out instances whose current status is healthy.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;

use agent_mesh_control::{ServiceInstance, ServiceRegistry};
use agent_mesh_core::events::{EventStore, ServiceStatus};

#[derive(Debug, Clone)]
enum Op {
    Register { slot: usize },
    Deregister { slot: usize },
    UpdateHealth { slot: usize, status: ServiceStatus },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..8usize).prop_map(|slot| Op::Register { slot }),
        (0..8usize).prop_map(|slot| Op::Deregister { slot }),
        ((0..8usize), status_strategy())
            .prop_map(|(slot, status)| Op::UpdateHealth { slot, status }),
    ]
}

fn status_strategy() -> impl Strategy<Value = ServiceStatus> {
    prop_oneof![
        Just(ServiceStatus::Healthy),
        Just(ServiceStatus::Unhealthy),
        Just(ServiceStatus::Degraded),
    ]
}

/// Slot n maps to a fixed service name, id, and non-conflicting port range.
fn instance_for_slot(slot: usize) -> ServiceInstance {
    let base = 50000 + (slot as u16) * 10;
    ServiceInstance {
        service_id: format!("id-{}", slot),
        name: format!("svc-{}", slot % 3),
        version: "1.0.0".to_string(),
        host: "h1".to_string(),
        grpc_port: base,
        health_port: base + 1,
        metrics_port: base + 2,
        manifest: json!({
            "kind": "AOLAgent",
            "apiVersion": "mesh/v1",
            "metadata": { "name": format!("svc-{}", slot % 3) },
            "spec": {},
        }),
        tags: BTreeSet::new(),
        meta: HashMap::new(),
        status: ServiceStatus::Starting,
        last_heartbeat: Utc::now(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn list_all_reflects_live_registrations(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let store = Arc::new(EventStore::new(1000));
            let registry = ServiceRegistry::new(store);
            // Model: slot -> registered?
            let mut live: HashMap<usize, ServiceStatus> = HashMap::new();

            for op in ops {
                match op {
                    Op::Register { slot } => {
                        let outcome = registry.register(instance_for_slot(slot)).await;
                        if live.contains_key(&slot) {
                            prop_assert!(outcome.is_err());
                        } else {
                            prop_assert!(outcome.is_ok());
                            live.insert(slot, ServiceStatus::Starting);
                        }
                    }
                    Op::Deregister { slot } => {
                        let instance = instance_for_slot(slot);
                        let outcome = registry
                            .deregister(&instance.name, &instance.service_id)
                            .await;
                        prop_assert_eq!(outcome.is_ok(), live.remove(&slot).is_some());
                    }
                    Op::UpdateHealth { slot, status } => {
                        let instance = instance_for_slot(slot);
                        let outcome = registry
                            .update_health(&instance.name, &instance.service_id, status)
                            .await;
                        match live.get_mut(&slot) {
                            Some(current) => {
                                if outcome.is_ok() {
                                    *current = status;
                                }
                            }
                            None => prop_assert!(outcome.is_err()),
                        }
                    }
                }

                // Invariant 1: every live instance appears exactly once.
                let listed = registry.list_all().await;
                let mut seen: Vec<String> = listed
                    .values()
                    .flatten()
                    .map(|i| i.service_id.clone())
                    .collect();
                seen.sort();
                let mut expected: Vec<String> =
                    live.keys().map(|slot| format!("id-{}", slot)).collect();
                expected.sort();
                prop_assert_eq!(seen, expected);

                // Invariant 2: get_healthy only returns healthy instances.
                for service in ["svc-0", "svc-1", "svc-2"] {
                    match registry.get_healthy(service).await {
                        Some(instance) => {
                            prop_assert_eq!(instance.status, ServiceStatus::Healthy)
                        }
                        None => {
                            let any_healthy = live.iter().any(|(slot, status)| {
                                format!("svc-{}", slot % 3) == service
                                    && *status == ServiceStatus::Healthy
                            });
                            prop_assert!(!any_healthy);
                        }
                    }
                }
            }
            Ok(())
        })?;
    }
}
