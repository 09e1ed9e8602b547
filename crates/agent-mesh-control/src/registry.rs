//! Authoritative service registry.
//!
//! The registry is the canonical map of service name to instances. All
//! mutations are serialized behind one lock and observable by any
//! subsequent query; hot read paths clone under the same lock and do no
//! I/O. Registration enforces the manifest shape, global `service_id`
//! uniqueness, and host/port uniqueness; health updates go through the
//! status state machine and emit `health_changed` only on real
//! transitions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use agent_mesh_core::error::MeshError;
use agent_mesh_core::events::{Event, EventPayload, EventStore, Metadata, ServiceStatus};

/// Manifest keys every service document must carry.
const REQUIRED_MANIFEST_FIELDS: [&str; 4] = ["kind", "apiVersion", "metadata", "spec"];

/// One running service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Globally unique, stable id.
    pub service_id: String,
    /// Logical service name; many instances may share it.
    pub name: String,
    pub version: String,
    pub host: String,
    pub grpc_port: u16,
    pub health_port: u16,
    pub metrics_port: u16,
    /// Free-form manifest document (kind, apiVersion, metadata, spec).
    pub manifest: Value,
    pub tags: BTreeSet<String>,
    pub meta: HashMap<String, String>,
    pub status: ServiceStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInstance {
    /// The instance's `host:grpc_port` routing address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.grpc_port)
    }

    fn ports(&self) -> [u16; 3] {
        [self.grpc_port, self.health_port, self.metrics_port]
    }
}

/// An observed health-status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub old_status: ServiceStatus,
    pub new_status: ServiceStatus,
}

/// Point-in-time deep copy of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub taken_at: DateTime<Utc>,
    pub services: HashMap<String, Vec<ServiceInstance>>,
}

struct RegistryState {
    services: HashMap<String, Vec<ServiceInstance>>,
    /// service_id -> service name, for global uniqueness and reverse lookup.
    ids: HashMap<String, String>,
    /// Shared round-robin cursor per service name.
    round_robin: HashMap<String, usize>,
}

/// The canonical in-memory service registry.
pub struct ServiceRegistry {
    store: Arc<EventStore>,
    state: Mutex<RegistryState>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            store,
            state: Mutex::new(RegistryState {
                services: HashMap::new(),
                ids: HashMap::new(),
                round_robin: HashMap::new(),
            }),
        }
    }

    /// Register an instance. Fails on a malformed manifest, a reused
    /// `service_id`, or any port collision on the same host; no state
    /// changes on failure.
    pub async fn register(&self, instance: ServiceInstance) -> Result<(), MeshError> {
        validate_manifest(&instance.manifest)?;
        {
            let mut state = self.state.lock().await;
            if state.ids.contains_key(&instance.service_id) {
                return Err(MeshError::DuplicateServiceId {
                    service_id: instance.service_id.clone(),
                });
            }
            for existing in state.services.values().flatten() {
                if existing.host != instance.host {
                    continue;
                }
                for port in instance.ports() {
                    if existing.ports().contains(&port) {
                        return Err(MeshError::PortConflict {
                            host: instance.host.clone(),
                            port,
                            existing_service_id: existing.service_id.clone(),
                        });
                    }
                }
            }
            state
                .ids
                .insert(instance.service_id.clone(), instance.name.clone());
            state
                .services
                .entry(instance.name.clone())
                .or_default()
                .push(instance.clone());
        }
        tracing::info!(
            service = %instance.name,
            service_id = %instance.service_id,
            address = %instance.address(),
            "registered service instance"
        );
        let mut metadata = Metadata::new();
        metadata.insert("host".to_string(), json!(instance.host));
        metadata.insert("grpc_port".to_string(), json!(instance.grpc_port));
        metadata.insert("version".to_string(), json!(instance.version));
        self.store
            .append(Event::new(EventPayload::ServiceRegistered {
                service_name: instance.name,
                service_id: instance.service_id,
                metadata,
            }))
            .await;
        Ok(())
    }

    /// Remove an instance. Emits `service_deregistered` only when an
    /// instance was actually removed.
    pub async fn deregister(&self, service_name: &str, service_id: &str) -> Result<(), MeshError> {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = match state.services.get_mut(service_name) {
                Some(instances) => {
                    let before = instances.len();
                    instances.retain(|i| i.service_id != service_id);
                    before != instances.len()
                }
                None => false,
            };
            if removed {
                state.ids.remove(service_id);
                if state
                    .services
                    .get(service_name)
                    .map(|i| i.is_empty())
                    .unwrap_or(false)
                {
                    state.services.remove(service_name);
                    state.round_robin.remove(service_name);
                }
            }
            removed
        };
        if !removed {
            return Err(MeshError::ServiceNotFound {
                service: format!("{}/{}", service_name, service_id),
            });
        }
        tracing::info!(service = %service_name, service_id = %service_id, "deregistered service instance");
        self.store
            .append(Event::new(EventPayload::ServiceDeregistered {
                service_name: service_name.to_string(),
                service_id: service_id.to_string(),
            }))
            .await;
        Ok(())
    }

    /// One healthy instance of a service, round-robin across calls. A
    /// single shared cursor per name keeps the rotation stable under
    /// concurrent callers.
    pub async fn get_healthy(&self, service_name: &str) -> Option<ServiceInstance> {
        let mut state = self.state.lock().await;
        let healthy: Vec<ServiceInstance> = state
            .services
            .get(service_name)?
            .iter()
            .filter(|i| i.status == ServiceStatus::Healthy)
            .cloned()
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let cursor = state
            .round_robin
            .entry(service_name.to_string())
            .or_insert(0);
        let selected = healthy[*cursor % healthy.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(selected)
    }

    /// All instances of one service (empty for unknown names).
    pub async fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.state
            .lock()
            .await
            .services
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    /// One instance by name and id.
    pub async fn get(&self, service_name: &str, service_id: &str) -> Option<ServiceInstance> {
        self.state
            .lock()
            .await
            .services
            .get(service_name)?
            .iter()
            .find(|i| i.service_id == service_id)
            .cloned()
    }

    /// Every registered instance, grouped by service name.
    pub async fn list_all(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.state.lock().await.services.clone()
    }

    /// Consistent deep copy of the registry.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock().await;
        RegistrySnapshot {
            taken_at: Utc::now(),
            services: state.services.clone(),
        }
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.state.lock().await.services.keys().cloned().collect()
    }

    /// Apply a health-status change through the state machine. Returns the
    /// transition when the status actually changed (and emits exactly one
    /// `health_changed` event for it); repeating the current status is a
    /// no-op that still refreshes the heartbeat.
    pub async fn update_health(
        &self,
        service_name: &str,
        service_id: &str,
        new_status: ServiceStatus,
    ) -> Result<Option<StatusTransition>, MeshError> {
        let transition = {
            let mut state = self.state.lock().await;
            let instance = state
                .services
                .get_mut(service_name)
                .and_then(|instances| instances.iter_mut().find(|i| i.service_id == service_id))
                .ok_or_else(|| MeshError::ServiceNotFound {
                    service: format!("{}/{}", service_name, service_id),
                })?;
            let old_status = instance.status;
            if old_status == new_status {
                instance.last_heartbeat = Utc::now();
                None
            } else if transition_allowed(old_status, new_status) {
                instance.status = new_status;
                instance.last_heartbeat = Utc::now();
                Some(StatusTransition {
                    old_status,
                    new_status,
                })
            } else {
                return Err(MeshError::InvalidTransition {
                    service_id: service_id.to_string(),
                    from: old_status.to_string(),
                    to: new_status.to_string(),
                });
            }
        };
        if let Some(transition) = transition {
            tracing::debug!(
                service = %service_name,
                service_id = %service_id,
                old_status = %transition.old_status,
                new_status = %transition.new_status,
                "service health changed"
            );
            self.store
                .append(Event::new(EventPayload::HealthChanged {
                    service_name: service_name.to_string(),
                    service_id: service_id.to_string(),
                    old_status: transition.old_status,
                    new_status: transition.new_status,
                    metadata: Metadata::new(),
                }))
                .await;
        }
        Ok(transition)
    }

    /// Remove instances whose heartbeat is older than `ttl`. Expiring
    /// instances pass through `stopping` on their way out; `starting`
    /// instances are left alone (they have not probed yet). Returns the
    /// removed instances.
    pub async fn expire_stale(&self, ttl: std::time::Duration) -> Vec<ServiceInstance> {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(90));
        let now = Utc::now();
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().await;
            let names: Vec<String> = state.services.keys().cloned().collect();
            for name in names {
                if let Some(instances) = state.services.get_mut(&name) {
                    let (stale, live): (Vec<_>, Vec<_>) = instances.drain(..).partition(|i| {
                        i.status != ServiceStatus::Starting
                            && now.signed_duration_since(i.last_heartbeat) > ttl
                    });
                    *instances = live;
                    removed.extend(stale.into_iter().map(|mut i| {
                        i.status = ServiceStatus::Stopping;
                        i
                    }));
                }
                if state
                    .services
                    .get(&name)
                    .map(|i| i.is_empty())
                    .unwrap_or(false)
                {
                    state.services.remove(&name);
                    state.round_robin.remove(&name);
                }
            }
            for instance in &removed {
                state.ids.remove(&instance.service_id);
            }
        }
        for instance in &removed {
            tracing::warn!(
                service = %instance.name,
                service_id = %instance.service_id,
                "expiring instance after missed heartbeats"
            );
            self.store
                .append(Event::new(EventPayload::ServiceDeregistered {
                    service_name: instance.name.clone(),
                    service_id: instance.service_id.clone(),
                }))
                .await;
        }
        removed
    }
}

/// Allowed status transitions. Same-status updates are handled before
/// this check.
fn transition_allowed(from: ServiceStatus, to: ServiceStatus) -> bool {
    use ServiceStatus::*;
    matches!(
        (from, to),
        (Starting, Healthy)
            | (Starting, Unhealthy)
            | (Healthy, Unhealthy)
            | (Unhealthy, Healthy)
            | (Healthy, Degraded)
            | (Degraded, Healthy)
            | (Degraded, Unhealthy)
            | (Unhealthy, Degraded)
            | (Healthy, Stopping)
            | (Unhealthy, Stopping)
            | (Degraded, Stopping)
    )
}

fn validate_manifest(manifest: &Value) -> Result<(), MeshError> {
    let object = manifest.as_object().ok_or_else(|| MeshError::InvalidManifest {
        missing: "kind".to_string(),
    })?;
    for field in REQUIRED_MANIFEST_FIELDS {
        if !object.contains_key(field) {
            return Err(MeshError::InvalidManifest {
                missing: field.to_string(),
            });
        }
    }
    Ok(())
}

/// A minimal valid manifest for instances learned from the discovery
/// provider, which does not carry manifests.
pub(crate) fn synthetic_manifest(name: &str) -> Value {
    json!({
        "kind": "AOLService",
        "apiVersion": "mesh/v1",
        "metadata": { "name": name, "source": "discovery" },
        "spec": {},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_mesh_core::events::{EventFilter, EventKind};

    fn instance(name: &str, id: &str, host: &str, base_port: u16) -> ServiceInstance {
        ServiceInstance {
            service_id: id.to_string(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            host: host.to_string(),
            grpc_port: base_port,
            health_port: base_port + 1,
            metrics_port: base_port + 2,
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

    fn registry() -> (Arc<EventStore>, ServiceRegistry) {
        let store = Arc::new(EventStore::new(1000));
        let registry = ServiceRegistry::new(store.clone());
        (store, registry)
    }

    #[tokio::test]
    async fn register_then_deregister_restores_prior_state() {
        let (_store, registry) = registry();
        registry
            .register(instance("svc-a", "id-1", "h1", 50051))
            .await
            .unwrap();
        let before = registry.list_all().await;
        assert_eq!(before["svc-a"].len(), 1);

        registry
            .register(instance("svc-a", "id-2", "h2", 50051))
            .await
            .unwrap();
        registry.deregister("svc-a", "id-2").await.unwrap();
        let after = registry.list_all().await;
        assert_eq!(after["svc-a"].len(), 1);
        assert_eq!(after["svc-a"][0].service_id, "id-1");
    }

    #[tokio::test]
    async fn rejects_port_conflict_on_same_host() {
        let (_store, registry) = registry();
        registry
            .register(instance("svc-a", "id-1", "h1", 50051))
            .await
            .unwrap();
        // Same host, overlapping health port.
        let mut other = instance("svc-b", "id-2", "h1", 50050);
        other.health_port = 50051;
        let err = registry.register(other).await.unwrap_err();
        assert!(matches!(err, MeshError::PortConflict { port: 50051, .. }));
        // Different host, same ports: fine.
        registry
            .register(instance("svc-b", "id-3", "h2", 50051))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_manifest_missing_required_field() {
        let (_store, registry) = registry();
        let mut bad = instance("svc-a", "id-1", "h1", 50051);
        bad.manifest = json!({ "kind": "AOLAgent", "metadata": {}, "spec": {} });
        let err = registry.register(bad).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidManifest { missing } if missing == "apiVersion"));
        assert!(registry.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_duplicate_service_id() {
        let (_store, registry) = registry();
        registry
            .register(instance("svc-a", "id-1", "h1", 50051))
            .await
            .unwrap();
        let err = registry
            .register(instance("svc-b", "id-1", "h2", 50051))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::DuplicateServiceId { .. }));
    }

    #[tokio::test]
    async fn get_healthy_returns_only_healthy_round_robin() {
        let (_store, registry) = registry();
        for (id, port) in [("id-1", 50051u16), ("id-2", 50061), ("id-3", 50071)] {
            registry.register(instance("svc-a", id, "h1", port)).await.unwrap();
        }
        assert!(registry.get_healthy("svc-a").await.is_none());

        registry
            .update_health("svc-a", "id-1", ServiceStatus::Healthy)
            .await
            .unwrap();
        registry
            .update_health("svc-a", "id-2", ServiceStatus::Healthy)
            .await
            .unwrap();

        let first = registry.get_healthy("svc-a").await.unwrap();
        let second = registry.get_healthy("svc-a").await.unwrap();
        let third = registry.get_healthy("svc-a").await.unwrap();
        assert_ne!(first.service_id, second.service_id);
        assert_eq!(first.service_id, third.service_id);
        assert!(first.status == ServiceStatus::Healthy && second.status == ServiceStatus::Healthy);
    }

    #[tokio::test]
    async fn unknown_service_queries_return_empty() {
        let (_store, registry) = registry();
        assert!(registry.get_healthy("nope").await.is_none());
        assert!(registry.instances("nope").await.is_empty());
    }

    #[tokio::test]
    async fn repeated_status_update_emits_one_event() {
        let (store, registry) = registry();
        registry
            .register(instance("svc-a", "id-1", "h1", 50051))
            .await
            .unwrap();
        let first = registry
            .update_health("svc-a", "id-1", ServiceStatus::Healthy)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = registry
            .update_health("svc-a", "id-1", ServiceStatus::Healthy)
            .await
            .unwrap();
        assert!(second.is_none());

        let events = store
            .get_events(EventFilter {
                kind: Some(EventKind::HealthChanged),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn forbids_transitions_outside_the_state_machine() {
        let (_store, registry) = registry();
        registry
            .register(instance("svc-a", "id-1", "h1", 50051))
            .await
            .unwrap();
        // starting -> stopping is not a probe-reachable transition.
        let err = registry
            .update_health("svc-a", "id-1", ServiceStatus::Stopping)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { .. }));
        // The failed update left the status untouched.
        let current = registry.get("svc-a", "id-1").await.unwrap();
        assert_eq!(current.status, ServiceStatus::Starting);
    }

    #[tokio::test]
    async fn expires_instances_past_heartbeat_ttl() {
        let (store, registry) = registry();
        registry
            .register(instance("svc-a", "id-1", "h1", 50051))
            .await
            .unwrap();
        registry
            .update_health("svc-a", "id-1", ServiceStatus::Healthy)
            .await
            .unwrap();
        // Backdate the heartbeat by mutating through a re-registration is
        // not possible; instead expire with a zero TTL.
        let removed = registry.expire_stale(std::time::Duration::from_secs(0)).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].status, ServiceStatus::Stopping);
        assert!(registry.list_all().await.is_empty());

        let events = store
            .get_events(EventFilter {
                kind: Some(EventKind::ServiceDeregistered),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn starting_instances_survive_the_reaper() {
        let (_store, registry) = registry();
        registry
            .register(instance("svc-a", "id-1", "h1", 50051))
            .await
            .unwrap();
        let removed = registry.expire_stale(std::time::Duration::from_secs(0)).await;
        assert!(removed.is_empty());
        assert_eq!(registry.instances("svc-a").await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_is_a_deep_copy() {
        let (_store, registry) = registry();
        registry
            .register(instance("svc-a", "id-1", "h1", 50051))
            .await
            .unwrap();
        let snapshot = registry.snapshot().await;
        registry.deregister("svc-a", "id-1").await.unwrap();
        assert_eq!(snapshot.services["svc-a"].len(), 1);
        assert!(registry.list_all().await.is_empty());
    }
}
