//! Health-aware instance selection.
//!
//! The balancer owns per-instance request metrics and the per-instance
//! circuit breakers, all under a single lock. Selection filters to
//! healthy instances (falling back to all when none are), drops instances
//! whose breaker rejects the call, then applies the routing strategy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use agent_mesh_control::ServiceInstance;
use agent_mesh_core::config::CircuitBreakerConfig;
use agent_mesh_core::events::ServiceStatus;

use crate::circuit::{CircuitBreaker, CircuitState};

/// How the router picks an instance for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    HealthAware,
    LatencyBased,
    LeastConnections,
    /// Caller pre-selected the target; no scoring.
    Conditional,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::HealthAware => "health_aware",
            RoutingStrategy::LatencyBased => "latency_based",
            RoutingStrategy::LeastConnections => "least_connections",
            RoutingStrategy::Conditional => "conditional",
        }
    }
}

/// Rolling per-instance request metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_latency_ms: f64,
    pub active_connections: u32,
}

impl InstanceMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_latency_ms / self.total_requests as f64
    }

    /// Quality score in [0, 1]: success rate weighted against a latency
    /// factor normalized around one second.
    pub fn health_score(&self) -> f64 {
        let latency_factor = 1.0 / (1.0 + self.avg_latency_ms() / 1000.0);
        0.7 * self.success_rate() + 0.3 * latency_factor
    }
}

struct BalancerState {
    metrics: HashMap<String, InstanceMetrics>,
    breakers: HashMap<String, CircuitBreaker>,
    rotation: u64,
}

/// Instance selector with per-instance breakers and metrics.
pub struct LoadBalancer {
    cb_config: CircuitBreakerConfig,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(cb_config: CircuitBreakerConfig) -> Self {
        Self {
            cb_config,
            state: Mutex::new(BalancerState {
                metrics: HashMap::new(),
                breakers: HashMap::new(),
                rotation: 0,
            }),
        }
    }

    /// Pick an instance for a request, or `None` when every candidate is
    /// rejected by its breaker (or the list is empty).
    pub async fn select(
        &self,
        instances: &[ServiceInstance],
        strategy: RoutingStrategy,
    ) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let healthy: Vec<&ServiceInstance> = {
            let filtered: Vec<&ServiceInstance> = instances
                .iter()
                .filter(|i| i.status == ServiceStatus::Healthy)
                .collect();
            if filtered.is_empty() {
                instances.iter().collect()
            } else {
                filtered
            }
        };

        let mut state = self.state.lock().await;
        let cb_config = self.cb_config.clone();
        let admitted: Vec<&ServiceInstance> = healthy
            .into_iter()
            .filter(|instance| {
                state
                    .breakers
                    .entry(instance.address())
                    .or_insert_with(|| CircuitBreaker::new(cb_config.clone()))
                    .allow_request()
            })
            .collect();
        if admitted.is_empty() {
            return None;
        }

        let selected = match strategy {
            RoutingStrategy::RoundRobin => {
                let index = (state.rotation as usize) % admitted.len();
                state.rotation = state.rotation.wrapping_add(1);
                admitted[index]
            }
            RoutingStrategy::HealthAware => admitted
                .iter()
                .max_by(|a, b| {
                    score(&state.metrics, a)
                        .total_cmp(&score(&state.metrics, b))
                })
                .copied()
                .unwrap_or(admitted[0]),
            RoutingStrategy::LatencyBased => admitted
                .iter()
                .min_by(|a, b| {
                    latency(&state.metrics, a).total_cmp(&latency(&state.metrics, b))
                })
                .copied()
                .unwrap_or(admitted[0]),
            RoutingStrategy::LeastConnections => admitted
                .iter()
                .min_by_key(|i| connections(&state.metrics, i))
                .copied()
                .unwrap_or(admitted[0]),
            RoutingStrategy::Conditional => admitted[0],
        };
        Some(selected.clone())
    }

    /// Record the outcome of one routed call against an instance.
    pub async fn record_result(&self, instance_key: &str, latency_ms: f64, success: bool) {
        let mut state = self.state.lock().await;
        let metrics = state.metrics.entry(instance_key.to_string()).or_default();
        metrics.total_requests += 1;
        metrics.total_latency_ms += latency_ms;
        if success {
            metrics.successful_requests += 1;
        }
        let cb_config = self.cb_config.clone();
        let breaker = state
            .breakers
            .entry(instance_key.to_string())
            .or_insert_with(|| CircuitBreaker::new(cb_config));
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    pub async fn connection_opened(&self, instance_key: &str) {
        let mut state = self.state.lock().await;
        state
            .metrics
            .entry(instance_key.to_string())
            .or_default()
            .active_connections += 1;
    }

    pub async fn connection_closed(&self, instance_key: &str) {
        let mut state = self.state.lock().await;
        if let Some(metrics) = state.metrics.get_mut(instance_key) {
            metrics.active_connections = metrics.active_connections.saturating_sub(1);
        }
    }

    pub async fn circuit_state(&self, instance_key: &str) -> Option<CircuitState> {
        let mut state = self.state.lock().await;
        state.breakers.get_mut(instance_key).map(|b| b.state())
    }

    pub async fn instance_metrics(&self, instance_key: &str) -> Option<InstanceMetrics> {
        self.state.lock().await.metrics.get(instance_key).cloned()
    }

    pub async fn tracked_instances(&self) -> usize {
        self.state.lock().await.metrics.len()
    }
}

fn score(metrics: &HashMap<String, InstanceMetrics>, instance: &ServiceInstance) -> f64 {
    metrics
        .get(&instance.address())
        .map(|m| m.health_score())
        .unwrap_or(1.0)
}

fn latency(metrics: &HashMap<String, InstanceMetrics>, instance: &ServiceInstance) -> f64 {
    metrics
        .get(&instance.address())
        .map(|m| m.avg_latency_ms())
        .unwrap_or(0.0)
}

fn connections(metrics: &HashMap<String, InstanceMetrics>, instance: &ServiceInstance) -> u32 {
    metrics
        .get(&instance.address())
        .map(|m| m.active_connections)
        .unwrap_or(0)
}
