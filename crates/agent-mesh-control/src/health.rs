//! Health supervision: probe sweeps, TTL reaping, and discovery sync.
//!
//! Every `check_interval` the supervisor probes each known instance's
//! `/health` endpoint concurrently (one slow probe never delays the rest),
//! maps the result through the status state machine, and feeds the
//! response-time sample into the credit engine's rolling average. A
//! `starting` instance gets one grace failure before it is marked
//! unhealthy. Instances that miss heartbeats for the TTL are reaped.
//!
//! The supervisor also owns the discovery-provider relationship: local
//! registrations are mirrored out, and `watch` updates reconcile external
//! membership into the registry (external wins for membership, local
//! probe-derived status wins between polls).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use agent_mesh_core::config::HealthConfig;
use agent_mesh_core::credit::CreditEngine;
use agent_mesh_core::error::{retry_with_policy, MeshError, RetryPolicy};
use agent_mesh_core::events::{Event, EventPayload, EventStore, Metadata, ServiceStatus};

use crate::discovery::{CheckSpec, DiscoveryProvider, RemoteInstance, RemoteRegistration};
use crate::registry::{synthetic_manifest, ServiceInstance, ServiceRegistry};

/// Fallback ports for instances learned from discovery, which only carry
/// their routing port plus whatever lands in `meta`.
const DEFAULT_HEALTH_PORT: u16 = 50200;
const DEFAULT_METRICS_PORT: u16 = 8080;

/// Wait used for discovery blocking queries.
const WATCH_WAIT: Duration = Duration::from_secs(30);

/// Periodic health supervisor.
pub struct HealthSupervisor {
    registry: Arc<ServiceRegistry>,
    store: Arc<EventStore>,
    config: HealthConfig,
    client: reqwest::Client,
    credit: Option<Arc<CreditEngine>>,
    discovery: Option<Arc<dyn DiscoveryProvider>>,
    /// Instance ids that already consumed their starting-grace failure.
    graced: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        store: Arc<EventStore>,
        config: HealthConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            store,
            config,
            client,
            credit: None,
            discovery: None,
            graced: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Feed probe latency samples into the credit engine.
    pub fn with_credit(mut self, credit: Arc<CreditEngine>) -> Self {
        self.credit = Some(credit);
        self
    }

    /// Mirror registrations into an external discovery provider.
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryProvider>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Start the periodic sweep loop. Runs until [`HealthSupervisor::stop`].
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(supervisor.config.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        supervisor.sweep().await;
                    }
                }
            }
            tracing::info!("health supervisor stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// One probe sweep over every registered instance, followed by TTL
    /// reaping. Probes run concurrently under the per-probe deadline.
    pub async fn sweep(&self) {
        let services = self.registry.list_all().await;
        let probes = services
            .values()
            .flatten()
            .filter(|i| i.status != ServiceStatus::Stopping)
            .cloned()
            .map(|instance| self.probe_instance(instance));
        join_all(probes).await;
        self.reap_stale().await;
    }

    /// Probe one instance and apply the outcome to the registry.
    async fn probe_instance(&self, instance: ServiceInstance) {
        let url = format!("http://{}:{}/health", instance.host, instance.health_port);
        let started = Instant::now();
        let outcome = self.client.get(&url).send().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let probe_ok = match &outcome {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };

        if let Some(credit) = &self.credit {
            credit
                .record_probe_sample(&instance.service_id, latency_ms, probe_ok)
                .await;
        }

        let new_status = if probe_ok {
            self.graced.lock().await.remove(&instance.service_id);
            ServiceStatus::Healthy
        } else {
            if instance.status == ServiceStatus::Starting {
                let mut graced = self.graced.lock().await;
                if graced.insert(instance.service_id.clone()) {
                    // First failed probe after registration: stay starting.
                    tracing::debug!(
                        service = %instance.name,
                        service_id = %instance.service_id,
                        "probe failed within starting grace period"
                    );
                    return;
                }
            }
            ServiceStatus::Unhealthy
        };

        match self
            .registry
            .update_health(&instance.name, &instance.service_id, new_status)
            .await
        {
            Ok(_) => {}
            Err(MeshError::ServiceNotFound { .. }) => {
                // Deregistered while the probe was in flight.
            }
            Err(err) => {
                tracing::debug!(
                    service = %instance.name,
                    service_id = %instance.service_id,
                    error = %err,
                    "probe result not applied"
                );
            }
        }
    }

    /// Reap instances past the heartbeat TTL and mirror the removals.
    async fn reap_stale(&self) {
        let removed = self.registry.expire_stale(self.config.heartbeat_ttl).await;
        for instance in removed {
            if let Some(credit) = &self.credit {
                credit.forget_agent(&instance.service_id).await;
            }
            if let Some(discovery) = &self.discovery {
                if let Err(err) = discovery.deregister_remote(&instance.service_id).await {
                    tracing::warn!(
                        service_id = %instance.service_id,
                        error = %err,
                        "failed to mirror expiry to discovery provider"
                    );
                }
            }
        }
    }

    /// Register an instance locally and mirror it to the discovery
    /// provider. Mirror failures are logged, not fatal.
    pub async fn register_service(&self, instance: ServiceInstance) -> Result<(), MeshError> {
        self.registry.register(instance.clone()).await?;
        if let Some(discovery) = &self.discovery {
            let registration = RemoteRegistration {
                service_id: instance.service_id.clone(),
                name: instance.name.clone(),
                host: instance.host.clone(),
                port: instance.grpc_port,
                tags: instance.tags.iter().cloned().collect(),
                meta: mirror_meta(&instance),
                check: Some(CheckSpec {
                    http: format!("http://{}:{}/health", instance.host, instance.health_port),
                    interval: self.config.check_interval.min(Duration::from_secs(10)),
                    timeout: self.config.probe_timeout,
                    ..CheckSpec::default()
                }),
            };
            let policy = RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(250),
                multiplier: 2.0,
            };
            let deadline = Instant::now() + Duration::from_secs(5);
            let mirror = retry_with_policy(&policy, deadline, "discovery register", || {
                discovery.register_remote(registration.clone())
            })
            .await;
            if let Err(err) = mirror {
                tracing::warn!(
                    service = %instance.name,
                    service_id = %instance.service_id,
                    error = %err,
                    "failed to mirror registration to discovery provider"
                );
            }
        }
        Ok(())
    }

    /// Deregister locally and mirror the removal.
    pub async fn deregister_service(
        &self,
        service_name: &str,
        service_id: &str,
    ) -> Result<(), MeshError> {
        self.registry.deregister(service_name, service_id).await?;
        self.graced.lock().await.remove(service_id);
        if let Some(credit) = &self.credit {
            credit.forget_agent(service_id).await;
        }
        if let Some(discovery) = &self.discovery {
            if let Err(err) = discovery.deregister_remote(service_id).await {
                tracing::warn!(
                    service_id = %service_id,
                    error = %err,
                    "failed to mirror deregistration to discovery provider"
                );
            }
        }
        Ok(())
    }

    /// Run a blocking-query watch for one service until shutdown,
    /// reconciling membership on every index change.
    pub fn spawn_watch(self: &Arc<Self>, service_name: String) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let discovery = match &supervisor.discovery {
                Some(discovery) => discovery.clone(),
                None => return,
            };
            let mut index = 0u64;
            loop {
                if supervisor.shutdown.is_cancelled() {
                    break;
                }
                match discovery.watch(&service_name, index, WATCH_WAIT).await {
                    Ok((next_index, instances)) => {
                        if next_index != index {
                            supervisor
                                .reconcile_membership(&service_name, instances)
                                .await;
                            index = next_index;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            service = %service_name,
                            error = %err,
                            "discovery watch failed; backing off"
                        );
                        tokio::select! {
                            _ = supervisor.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                }
            }
        })
    }

    /// Reconcile one service's membership against the provider's view.
    /// External truth wins for membership; probe-derived status for
    /// surviving instances is kept local.
    pub async fn reconcile_membership(&self, service_name: &str, remote: Vec<RemoteInstance>) {
        let local = self.registry.instances(service_name).await;
        let local_ids: HashSet<&str> = local.iter().map(|i| i.service_id.as_str()).collect();
        let remote_ids: HashSet<&str> = remote.iter().map(|i| i.service_id.as_str()).collect();

        for discovered in remote.iter().filter(|r| !local_ids.contains(r.service_id.as_str())) {
            let instance = instance_from_remote(discovered);
            match self.registry.register(instance).await {
                Ok(()) => {
                    let mut metadata = Metadata::new();
                    metadata.insert("host".to_string(), json!(discovered.host));
                    metadata.insert("port".to_string(), json!(discovered.port));
                    metadata.insert("source".to_string(), json!("discovery"));
                    self.store
                        .append(Event::new(EventPayload::ServiceDiscovered {
                            service_name: service_name.to_string(),
                            metadata,
                        }))
                        .await;
                }
                Err(err) => {
                    tracing::warn!(
                        service = %service_name,
                        service_id = %discovered.service_id,
                        error = %err,
                        "failed to adopt discovered instance"
                    );
                }
            }
        }

        for departed in local.iter().filter(|l| !remote_ids.contains(l.service_id.as_str())) {
            if let Err(err) = self
                .registry
                .deregister(service_name, &departed.service_id)
                .await
            {
                tracing::debug!(
                    service = %service_name,
                    service_id = %departed.service_id,
                    error = %err,
                    "instance already removed during reconcile"
                );
            }
        }
    }
}

fn mirror_meta(instance: &ServiceInstance) -> HashMap<String, String> {
    let mut meta = instance.meta.clone();
    meta.insert("health_port".to_string(), instance.health_port.to_string());
    meta.insert(
        "metrics_port".to_string(),
        instance.metrics_port.to_string(),
    );
    meta.insert("version".to_string(), instance.version.clone());
    meta
}

fn instance_from_remote(remote: &RemoteInstance) -> ServiceInstance {
    let health_port = remote
        .meta
        .get("health_port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_HEALTH_PORT);
    let metrics_port = remote
        .meta
        .get("metrics_port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_METRICS_PORT);
    ServiceInstance {
        service_id: remote.service_id.clone(),
        name: remote.name.clone(),
        version: remote
            .meta
            .get("version")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        host: remote.host.clone(),
        grpc_port: remote.port,
        health_port,
        metrics_port,
        manifest: synthetic_manifest(&remote.name),
        tags: remote.tags.iter().cloned().collect(),
        meta: remote.meta.clone(),
        status: ServiceStatus::Starting,
        last_heartbeat: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_instance_ports_come_from_meta() {
        let mut meta = HashMap::new();
        meta.insert("health_port".to_string(), "6100".to_string());
        let remote = RemoteInstance {
            service_id: "id-1".to_string(),
            name: "svc-a".to_string(),
            host: "10.0.0.9".to_string(),
            port: 50051,
            tags: vec![],
            meta,
        };
        let instance = instance_from_remote(&remote);
        assert_eq!(instance.health_port, 6100);
        assert_eq!(instance.metrics_port, DEFAULT_METRICS_PORT);
        assert_eq!(instance.status, ServiceStatus::Starting);
    }

    #[test]
    fn mirror_meta_carries_auxiliary_ports() {
        let remote = RemoteInstance {
            service_id: "id-1".to_string(),
            name: "svc-a".to_string(),
            host: "h1".to_string(),
            port: 50051,
            tags: vec![],
            meta: HashMap::new(),
        };
        let mut instance = instance_from_remote(&remote);
        instance.health_port = 50052;
        instance.metrics_port = 50053;
        let meta = mirror_meta(&instance);
        assert_eq!(meta["health_port"], "50052");
        assert_eq!(meta["metrics_port"], "50053");
    }
}
