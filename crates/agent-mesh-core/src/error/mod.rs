//! # Error Handling for the Agent Mesh Control Plane
//!
//! All control-plane operations report failures through the [`MeshError`]
//! enum. Variants map to the semantic categories the mesh distinguishes:
//!
//! - **Invariant violations** ([`MeshError::PortConflict`],
//!   [`MeshError::InvalidManifest`], [`MeshError::CycleDetected`],
//!   [`MeshError::UnknownNode`], [`MeshError::InvalidTransition`]) are
//!   reported synchronously to the caller and never mutate state.
//! - **Remote failures** ([`MeshError::RemoteUnavailable`]) are retried per
//!   policy and surface only once retries are exhausted.
//! - **Deadlines** ([`MeshError::DeadlineExceeded`]) terminate the in-flight
//!   operation.
//! - **Saturation** ([`MeshError::QueueFull`]) is returned to explicit
//!   callers only; background producers drop oldest/slowest instead.
//!
//! Background tasks (health sweeps, credit ticks, bus dispatch) must never
//! propagate errors into the runtime: they log and continue.

mod retry;

pub use retry::{retry_with_policy, RetryPolicy};

/// Primary error type for all agent-mesh operations.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// One of the instance's ports collides with an existing instance on the
    /// same host.
    #[error("port conflict on host {host}: port {port} already in use by {existing_service_id}")]
    PortConflict {
        host: String,
        port: u16,
        existing_service_id: String,
    },

    /// A service manifest is missing one of the required top-level keys.
    #[error("invalid manifest: missing required field '{missing}'")]
    InvalidManifest { missing: String },

    /// A registration reused a `service_id` that is already live.
    #[error("service id already registered: {service_id}")]
    DuplicateServiceId { service_id: String },

    /// A status change was requested that the instance state machine forbids.
    #[error("invalid status transition for {service_id}: {from} -> {to}")]
    InvalidTransition {
        service_id: String,
        from: String,
        to: String,
    },

    /// The workflow graph contains a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    /// A workflow edge or execution step references a node that does not exist.
    #[error("unknown node: {node_id}")]
    UnknownNode { node_id: String },

    /// Workflow graph validation failed for a structural reason other than a
    /// cycle or a dangling reference.
    #[error("invalid workflow graph: {message}")]
    InvalidGraph { message: String },

    /// A registry lookup or mutation referenced a service that is not known.
    #[error("service not found: {service}")]
    ServiceNotFound { service: String },

    /// A remote peer (probe target, routed instance, discovery provider) was
    /// unreachable or answered with a failure.
    #[error("remote unavailable: {message}")]
    RemoteUnavailable { message: String },

    /// The operation's absolute deadline elapsed before completion.
    #[error("deadline exceeded: {operation}")]
    DeadlineExceeded { operation: String },

    /// A bounded queue rejected a submission at capacity.
    #[error("queue full: {queue}")]
    QueueFull { queue: String },

    /// The per-instance circuit breaker is open and the call was rejected
    /// without being attempted.
    #[error("circuit open for instance {instance}")]
    CircuitOpen { instance: String },

    /// Data could not be serialized or deserialized.
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    /// Startup configuration was invalid.
    #[error("configuration error: {message}")]
    ConfigurationError { message: String },

    /// An internal invariant was broken. The operation fails, the process
    /// continues.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Coarse error categories used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller mistake; retrying is pointless.
    InvariantViolation,
    /// Transient remote failure; retry per policy.
    Transient,
    /// The operation ran out of time; terminal for this attempt.
    Deadline,
    /// Backpressure; the caller may retry later.
    Saturation,
    /// Internal bug; log with full context.
    Internal,
}

impl MeshError {
    /// Classify this error for retry and propagation policy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MeshError::PortConflict { .. }
            | MeshError::InvalidManifest { .. }
            | MeshError::DuplicateServiceId { .. }
            | MeshError::InvalidTransition { .. }
            | MeshError::CycleDetected
            | MeshError::UnknownNode { .. }
            | MeshError::InvalidGraph { .. }
            | MeshError::ServiceNotFound { .. }
            | MeshError::ConfigurationError { .. } => ErrorCategory::InvariantViolation,
            MeshError::RemoteUnavailable { .. } | MeshError::CircuitOpen { .. } => {
                ErrorCategory::Transient
            }
            MeshError::DeadlineExceeded { .. } => ErrorCategory::Deadline,
            MeshError::QueueFull { .. } => ErrorCategory::Saturation,
            MeshError::SerializationError { .. } | MeshError::Internal { .. } => {
                ErrorCategory::Internal
            }
        }
    }

    /// True when a retry with backoff might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }

    pub fn remote_unavailable(message: impl Into<String>) -> Self {
        MeshError::RemoteUnavailable {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        MeshError::SerializationError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MeshError::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationError {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MeshError::DeadlineExceeded {
                operation: err
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "http request".to_string()),
            }
        } else {
            MeshError::RemoteUnavailable {
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violations_are_not_retryable() {
        let err = MeshError::InvalidManifest {
            missing: "kind".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::InvariantViolation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn remote_failures_are_retryable() {
        assert!(MeshError::remote_unavailable("connection refused").is_retryable());
        assert!(MeshError::CircuitOpen {
            instance: "h1:50051".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn deadline_is_terminal() {
        let err = MeshError::DeadlineExceeded {
            operation: "route".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Deadline);
        assert!(!err.is_retryable());
    }
}
