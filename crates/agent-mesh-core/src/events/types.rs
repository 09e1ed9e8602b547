//! Event model for the control plane.
//!
//! An [`Event`] is a common header (id, timestamp) plus an [`EventPayload`]
//! sum type with one variant per [`EventKind`]. Each variant carries only
//! the fields that kind needs; queries stay uniform through the accessor
//! methods ([`Event::kind`], [`Event::service_name`],
//! [`Event::workflow_id`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form event metadata.
pub type Metadata = Map<String, Value>;

/// The closed wire vocabulary of control-plane events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServiceRegistered,
    ServiceDeregistered,
    HealthChanged,
    RouteCalled,
    ServiceDiscovered,
    AgentContribution,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    DeliberationStarted,
    DeliberationRestarted,
    AgentLazyDetected,
}

impl EventKind {
    /// Every kind, in wire order.
    pub const ALL: [EventKind; 12] = [
        EventKind::ServiceRegistered,
        EventKind::ServiceDeregistered,
        EventKind::HealthChanged,
        EventKind::RouteCalled,
        EventKind::ServiceDiscovered,
        EventKind::AgentContribution,
        EventKind::WorkflowStarted,
        EventKind::WorkflowCompleted,
        EventKind::WorkflowFailed,
        EventKind::DeliberationStarted,
        EventKind::DeliberationRestarted,
        EventKind::AgentLazyDetected,
    ];

    /// The snake_case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ServiceRegistered => "service_registered",
            EventKind::ServiceDeregistered => "service_deregistered",
            EventKind::HealthChanged => "health_changed",
            EventKind::RouteCalled => "route_called",
            EventKind::ServiceDiscovered => "service_discovered",
            EventKind::AgentContribution => "agent_contribution",
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowFailed => "workflow_failed",
            EventKind::DeliberationStarted => "deliberation_started",
            EventKind::DeliberationRestarted => "deliberation_restarted",
            EventKind::AgentLazyDetected => "agent_lazy_detected",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service lifecycle status as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    ServiceRegistered {
        service_name: String,
        service_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    ServiceDeregistered {
        service_name: String,
        service_id: String,
    },
    HealthChanged {
        service_name: String,
        service_id: String,
        old_status: ServiceStatus,
        new_status: ServiceStatus,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    RouteCalled {
        source_service: String,
        target_service: String,
        method: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    ServiceDiscovered {
        service_name: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    AgentContribution {
        agent_id: String,
        workflow_id: String,
        contribution_score: f64,
        success: bool,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    WorkflowStarted {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    WorkflowCompleted {
        workflow_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    WorkflowFailed {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    DeliberationStarted {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    DeliberationRestarted {
        workflow_id: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
    AgentLazyDetected {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_id: Option<String>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Metadata,
    },
}

/// An immutable control-plane event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload with a fresh id and the current time.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            ts: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::ServiceRegistered { .. } => EventKind::ServiceRegistered,
            EventPayload::ServiceDeregistered { .. } => EventKind::ServiceDeregistered,
            EventPayload::HealthChanged { .. } => EventKind::HealthChanged,
            EventPayload::RouteCalled { .. } => EventKind::RouteCalled,
            EventPayload::ServiceDiscovered { .. } => EventKind::ServiceDiscovered,
            EventPayload::AgentContribution { .. } => EventKind::AgentContribution,
            EventPayload::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            EventPayload::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            EventPayload::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            EventPayload::DeliberationStarted { .. } => EventKind::DeliberationStarted,
            EventPayload::DeliberationRestarted { .. } => EventKind::DeliberationRestarted,
            EventPayload::AgentLazyDetected { .. } => EventKind::AgentLazyDetected,
        }
    }

    /// The service (or agent) this event is primarily about, if any.
    pub fn service_name(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::ServiceRegistered { service_name, .. }
            | EventPayload::ServiceDeregistered { service_name, .. }
            | EventPayload::HealthChanged { service_name, .. }
            | EventPayload::ServiceDiscovered { service_name, .. } => Some(service_name),
            EventPayload::AgentContribution { agent_id, .. }
            | EventPayload::AgentLazyDetected { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AgentContribution { workflow_id, .. }
            | EventPayload::WorkflowStarted { workflow_id, .. }
            | EventPayload::WorkflowCompleted { workflow_id, .. }
            | EventPayload::WorkflowFailed { workflow_id, .. }
            | EventPayload::DeliberationStarted { workflow_id, .. }
            | EventPayload::DeliberationRestarted { workflow_id, .. } => Some(workflow_id),
            EventPayload::AgentLazyDetected { workflow_id, .. } => workflow_id.as_deref(),
            _ => None,
        }
    }

    /// True when `name` appears as subject, source, or target of this event.
    pub fn involves_service(&self, name: &str) -> bool {
        if self.service_name() == Some(name) {
            return true;
        }
        match &self.payload {
            EventPayload::RouteCalled {
                source_service,
                target_service,
                ..
            } => source_service == name || target_service == name,
            _ => false,
        }
    }
}

/// One recorded unit of agent work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContribution {
    pub agent_id: String,
    pub workflow_id: String,
    pub turn: u32,
    pub action_type: ActionType,
    pub latency_ms: f64,
    pub success: bool,
    pub influence_score: f64,
    pub ts: DateTime<Utc>,
}

/// What kind of work a contribution represents. The weight feeds the
/// default influence heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Reasoning,
    Decision,
    Verification,
    Delegation,
    Contribution,
}

impl ActionType {
    /// Multiplier applied to the base success score by the default
    /// influence heuristic.
    pub fn influence_weight(&self) -> f64 {
        match self {
            ActionType::Reasoning => 1.2,
            ActionType::Decision => 1.5,
            ActionType::Verification => 1.0,
            ActionType::Delegation => 0.8,
            ActionType::Contribution => 1.0,
        }
    }
}

/// Lifecycle of a tracked workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Restarted,
}

/// A workflow tracked by the event store for credit assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub workflow_type: String,
    /// Participating agent ids, in registration order.
    pub agents: Vec<String>,
    pub state: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}
