//! Event model, bounded store, and pub/sub bus.

mod bus;
mod store;
mod types;

pub use bus::{
    service_channel, workflow_channel, EventBus, EventHandler, Subscription, DELIVERY_DEADLINE,
    GLOBAL_CHANNEL, HANDLER_DEADLINE, SUBSCRIBER_QUEUE_CAPACITY,
};
pub use store::{
    AgentReport, AgentTotals, EventFilter, EventStore, StoreStats, WorkflowAgentStats,
    WorkflowReport,
};
pub use types::{
    ActionType, AgentContribution, Event, EventKind, EventPayload, Metadata, ServiceStatus,
    Workflow, WorkflowStatus,
};
