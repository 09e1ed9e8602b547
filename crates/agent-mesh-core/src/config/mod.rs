//! Configuration for the control plane.
//!
//! All knobs load from `MESH_*` environment variables with validated
//! defaults. Invalid values fail startup; missing values take defaults.
//! Components receive the typed sub-structs, never raw env access.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, RetryPolicy};

/// Top-level control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub health: HealthConfig,
    pub event_store: EventStoreConfig,
    pub router: RouterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub lazy_detection: LazyDetectionConfig,
    pub workflow: WorkflowConfig,
}

/// Health supervision knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between probe sweeps.
    pub check_interval: Duration,
    /// Per-probe deadline.
    pub probe_timeout: Duration,
    /// Instances with no heartbeat for this long are reaped.
    pub heartbeat_ttl: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            heartbeat_ttl: Duration::from_secs(90),
        }
    }
}

/// Event store sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreConfig {
    /// Ring capacity; the oldest event is dropped on overflow.
    pub capacity: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Router queue and worker-pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 10_000,
        }
    }
}

/// Per-instance circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// How long an open circuit blocks before admitting a probe call.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Credit-assignment and restart-arbitration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyDetectionConfig {
    /// Rolling window of influence scores kept per agent.
    pub window_size: usize,
    /// Relative contribution below this is lazy; above its inverse is
    /// dominant.
    pub lazy_threshold: f64,
    /// Share of cumulative workflow influence above which one agent counts
    /// as dominating.
    pub dominance_threshold: f64,
    /// Minimum time between restarts of one workflow.
    pub restart_cooldown: Duration,
    /// Restart budget per workflow per hour.
    pub max_restarts_per_hour: usize,
    /// Exact Shapley enumeration is used up to this many agents.
    pub shapley_exact_agent_cap: usize,
    /// Permutation samples used above the exact cap.
    pub shapley_sample_budget: usize,
}

impl Default for LazyDetectionConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            lazy_threshold: 0.10,
            dominance_threshold: 0.70,
            restart_cooldown: Duration::from_secs(60),
            max_restarts_per_hour: 5,
            shapley_exact_agent_cap: 10,
            shapley_sample_budget: 2000,
        }
    }
}

/// Workflow execution deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub workflow_timeout: Duration,
    pub node_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workflow_timeout: Duration::from_secs(300),
            node_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            event_store: EventStoreConfig::default(),
            router: RouterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            lazy_detection: LazyDetectionConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from `MESH_*` environment variables, falling back
    /// to defaults and failing fast on unparseable or out-of-range values.
    pub fn from_env() -> Result<Self, MeshError> {
        let config = Self {
            health: HealthConfig {
                check_interval: Duration::from_secs(parse_var(
                    "MESH_HEALTH_CHECK_INTERVAL_SECS",
                    30u64,
                )?),
                probe_timeout: Duration::from_secs(parse_var(
                    "MESH_HEALTH_PROBE_TIMEOUT_SECS",
                    5u64,
                )?),
                heartbeat_ttl: Duration::from_secs(parse_var("MESH_HEARTBEAT_TTL_SECS", 90u64)?),
            },
            event_store: EventStoreConfig {
                capacity: parse_var("MESH_EVENT_STORE_CAPACITY", 1000usize)?,
            },
            router: RouterConfig {
                workers: parse_var("MESH_ROUTER_WORKERS", 4usize)?,
                queue_capacity: parse_var("MESH_ROUTER_QUEUE_CAPACITY", 10_000usize)?,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: parse_var("MESH_CB_FAILURE_THRESHOLD", 5u32)?,
                success_threshold: parse_var("MESH_CB_SUCCESS_THRESHOLD", 3u32)?,
                timeout: Duration::from_secs(parse_var("MESH_CB_TIMEOUT_SECS", 60u64)?),
            },
            retry: RetryPolicy {
                max_attempts: parse_var("MESH_RETRY_MAX_ATTEMPTS", 3u32)?,
                initial_delay: Duration::from_millis(parse_var(
                    "MESH_RETRY_INITIAL_DELAY_MS",
                    1000u64,
                )?),
                multiplier: parse_var("MESH_RETRY_MULTIPLIER", 2.0f64)?,
            },
            lazy_detection: LazyDetectionConfig {
                window_size: parse_var("MESH_LAZY_WINDOW_SIZE", 100usize)?,
                lazy_threshold: parse_var("MESH_LAZY_THRESHOLD", 0.10f64)?,
                dominance_threshold: parse_var("MESH_DOMINANCE_THRESHOLD", 0.70f64)?,
                restart_cooldown: Duration::from_secs(parse_var(
                    "MESH_RESTART_COOLDOWN_SECS",
                    60u64,
                )?),
                max_restarts_per_hour: parse_var("MESH_MAX_RESTARTS_PER_HOUR", 5usize)?,
                shapley_exact_agent_cap: parse_var("MESH_SHAPLEY_EXACT_AGENT_CAP", 10usize)?,
                shapley_sample_budget: parse_var("MESH_SHAPLEY_SAMPLE_BUDGET", 2000usize)?,
            },
            workflow: WorkflowConfig {
                workflow_timeout: Duration::from_secs(parse_var(
                    "MESH_WORKFLOW_TIMEOUT_SECS",
                    300u64,
                )?),
                node_timeout: Duration::from_secs(parse_var("MESH_NODE_TIMEOUT_SECS", 30u64)?),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Range checks that catch configurations which would wedge the mesh.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.event_store.capacity == 0 {
            return Err(configuration_error("event store capacity must be > 0"));
        }
        if self.router.workers == 0 {
            return Err(configuration_error("router worker count must be > 0"));
        }
        if self.router.queue_capacity == 0 {
            return Err(configuration_error("router queue capacity must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(configuration_error("circuit failure threshold must be > 0"));
        }
        if !(0.0..1.0).contains(&self.lazy_detection.lazy_threshold)
            || self.lazy_detection.lazy_threshold == 0.0
        {
            return Err(configuration_error("lazy threshold must be in (0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.lazy_detection.dominance_threshold) {
            return Err(configuration_error("dominance threshold must be in [0, 1]"));
        }
        if self.lazy_detection.window_size == 0 {
            return Err(configuration_error("detection window must be > 0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(configuration_error("retry multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

fn configuration_error(message: &str) -> MeshError {
    MeshError::ConfigurationError {
        message: message.to_string(),
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, MeshError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| MeshError::ConfigurationError {
            message: format!("invalid value for {}: {}", name, raw),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.event_store.capacity, 1000);
        assert_eq!(config.router.workers, 4);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.lazy_detection.lazy_threshold, 0.10);
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut config = CoreConfig::default();
        config.event_store.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(MeshError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_lazy_threshold() {
        let mut config = CoreConfig::default();
        config.lazy_detection.lazy_threshold = 1.5;
        assert!(config.validate().is_err());
        config.lazy_detection.lazy_threshold = 0.0;
        assert!(config.validate().is_err());
    }
}
