//! Bounded, in-memory event store with workflow and contribution tracking.
//!
//! The store owns three things for the lifetime of the process:
//! - the event ring: append-only, fixed capacity, oldest dropped on
//!   overflow (producers never block);
//! - the workflow table: lifecycle state, participants, restart counts;
//! - per-workflow contribution lists and per-agent running totals.
//!
//! All of it sits behind a single lock; queries are linearizable with
//! `append`. Fan-out to the bus happens after the ring mutation, outside
//! the lock, so a slow subscriber never stalls a producer holding it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::bus::EventBus;
use super::types::{
    AgentContribution, Event, EventKind, EventPayload, Metadata, Workflow, WorkflowStatus,
};
use crate::error::MeshError;

/// Query filter for [`EventStore::get_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub service: Option<String>,
    pub workflow: Option<String>,
    pub limit: Option<usize>,
}

/// Running totals for one agent across all workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTotals {
    pub total_contributions: u64,
    pub successful_contributions: u64,
    pub total_influence: f64,
    pub lazy_flags: u64,
    pub restart_triggers: u64,
}

/// Per-agent summary derived from the running totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub total_contributions: u64,
    pub successful_contributions: u64,
    pub success_rate: f64,
    pub total_influence: f64,
    pub average_influence: f64,
    pub lazy_flags: u64,
    pub restart_triggers: u64,
}

/// Per-agent slice of a workflow report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowAgentStats {
    pub contributions: u64,
    pub influence: f64,
    pub successes: u64,
}

/// Per-workflow summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub workflow_type: String,
    pub state: WorkflowStatus,
    pub agents: Vec<String>,
    pub started_at: chrono::DateTime<Utc>,
    pub restart_count: u32,
    pub total_contributions: usize,
    pub agent_stats: HashMap<String, WorkflowAgentStats>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_events: usize,
    pub by_kind: HashMap<String, usize>,
    pub recent_events: usize,
    pub dropped_events: u64,
    pub active_workflows: usize,
    pub completed_workflows: usize,
    pub failed_workflows: usize,
    pub agent_count: usize,
    pub total_contributions: u64,
    pub lazy_agent_flags: u64,
}

struct StoreState {
    events: VecDeque<Event>,
    workflows: HashMap<String, Workflow>,
    contributions: HashMap<String, Vec<AgentContribution>>,
    agent_totals: HashMap<String, AgentTotals>,
}

/// Bounded event store with pub/sub fan-out.
pub struct EventStore {
    capacity: usize,
    state: Mutex<StoreState>,
    bus: EventBus,
    dropped: AtomicU64,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(StoreState {
                events: VecDeque::with_capacity(capacity),
                workflows: HashMap::new(),
                contributions: HashMap::new(),
                agent_totals: HashMap::new(),
            }),
            bus: EventBus::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// The bus this store fans events out to.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped from the ring so far (saturation metric).
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append an event to the ring and fan it out. Never blocks the
    /// producer on ring capacity: at capacity the oldest event is dropped.
    pub async fn append(&self, event: Event) {
        {
            let mut state = self.state.lock().await;
            if state.events.len() == self.capacity {
                state.events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.events.push_back(event.clone());
        }
        self.bus.fan_out(&event).await;
    }

    /// The last `limit` events matching the filter, in insertion order.
    pub async fn get_events(&self, filter: EventFilter) -> Vec<Event> {
        let state = self.state.lock().await;
        let limit = filter.limit.unwrap_or(100);
        let mut matched: Vec<Event> = state
            .events
            .iter()
            .filter(|e| filter.kind.map_or(true, |k| e.kind() == k))
            .filter(|e| {
                filter
                    .service
                    .as_deref()
                    .map_or(true, |s| e.involves_service(s))
            })
            .filter(|e| {
                filter
                    .workflow
                    .as_deref()
                    .map_or(true, |w| e.workflow_id() == Some(w))
            })
            .cloned()
            .collect();
        if matched.len() > limit {
            matched.drain(..matched.len() - limit);
        }
        matched
    }

    /// Route events, optionally filtered by endpoint.
    pub async fn get_route_events(
        &self,
        source: Option<&str>,
        target: Option<&str>,
        limit: usize,
    ) -> Vec<Event> {
        let state = self.state.lock().await;
        let mut matched: Vec<Event> = state
            .events
            .iter()
            .filter(|e| match &e.payload {
                EventPayload::RouteCalled {
                    source_service,
                    target_service,
                    ..
                } => {
                    source.map_or(true, |s| source_service == s)
                        && target.map_or(true, |t| target_service == t)
                }
                _ => false,
            })
            .cloned()
            .collect();
        if matched.len() > limit {
            matched.drain(..matched.len() - limit);
        }
        matched
    }

    /// Begin tracking a workflow and emit `workflow_started`.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        agents: Vec<String>,
        metadata: Metadata,
    ) {
        let workflow = Workflow {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            agents: agents.clone(),
            state: WorkflowStatus::Running,
            started_at: Utc::now(),
            restart_count: 0,
            metadata: metadata.clone(),
        };
        {
            let mut state = self.state.lock().await;
            state.workflows.insert(workflow_id.to_string(), workflow);
        }
        let mut event_metadata = metadata;
        event_metadata.insert("workflow_type".to_string(), json!(workflow_type));
        event_metadata.insert("agents".to_string(), json!(agents));
        self.append(Event::new(EventPayload::WorkflowStarted {
            workflow_id: workflow_id.to_string(),
            metadata: event_metadata,
        }))
        .await;
    }

    /// Record a contribution against a running workflow. The influence
    /// score must already be assigned (see `credit::CreditEngine`).
    ///
    /// Contributions against a workflow that is no longer running are
    /// rejected; contributions for untracked workflows are accepted so
    /// standalone agents can still accumulate metrics.
    pub async fn record_contribution(
        &self,
        contribution: AgentContribution,
    ) -> Result<(), MeshError> {
        {
            let mut state = self.state.lock().await;
            if let Some(workflow) = state.workflows.get(&contribution.workflow_id) {
                if workflow.state != WorkflowStatus::Running
                    && workflow.state != WorkflowStatus::Restarted
                {
                    return Err(MeshError::InvalidTransition {
                        service_id: contribution.agent_id.clone(),
                        from: format!("workflow:{:?}", workflow.state),
                        to: "agent_contribution".to_string(),
                    });
                }
            }
            let totals = state
                .agent_totals
                .entry(contribution.agent_id.clone())
                .or_default();
            totals.total_contributions += 1;
            if contribution.success {
                totals.successful_contributions += 1;
            }
            totals.total_influence += contribution.influence_score;
            state
                .contributions
                .entry(contribution.workflow_id.clone())
                .or_default()
                .push(contribution.clone());
        }

        let mut metadata = Metadata::new();
        metadata.insert("turn".to_string(), json!(contribution.turn));
        metadata.insert(
            "action_type".to_string(),
            serde_json::to_value(contribution.action_type)?,
        );
        metadata.insert("latency_ms".to_string(), json!(contribution.latency_ms));
        self.append(Event::new(EventPayload::AgentContribution {
            agent_id: contribution.agent_id,
            workflow_id: contribution.workflow_id,
            contribution_score: contribution.influence_score,
            success: contribution.success,
            metadata,
        }))
        .await;
        Ok(())
    }

    /// Record that an agent was flagged lazy (bumps its flag counter and
    /// emits `agent_lazy_detected`).
    pub async fn flag_lazy_agent(&self, agent_id: &str, workflow_id: Option<&str>, metadata: Metadata) {
        {
            let mut state = self.state.lock().await;
            state.agent_totals.entry(agent_id.to_string()).or_default().lazy_flags += 1;
        }
        self.append(Event::new(EventPayload::AgentLazyDetected {
            agent_id: agent_id.to_string(),
            workflow_id: workflow_id.map(|w| w.to_string()),
            metadata,
        }))
        .await;
    }

    /// Deliberation restart: discard the workflow's contributions, bump its
    /// restart count, mark it `restarted`, and emit
    /// `deliberation_restarted`. `triggered_by` names the agent whose
    /// behavior caused the restart, if one did.
    pub async fn mark_restarted(
        &self,
        workflow_id: &str,
        reason: &str,
        triggered_by: Option<&str>,
    ) {
        let discarded;
        let previous_state;
        {
            let mut state = self.state.lock().await;
            discarded = state
                .contributions
                .insert(workflow_id.to_string(), Vec::new())
                .map(|c| c.len())
                .unwrap_or(0);
            if let Some(agent_id) = triggered_by {
                state
                    .agent_totals
                    .entry(agent_id.to_string())
                    .or_default()
                    .restart_triggers += 1;
            }
            previous_state = match state.workflows.get_mut(workflow_id) {
                Some(workflow) => {
                    let previous = workflow.state;
                    workflow.state = WorkflowStatus::Restarted;
                    workflow.restart_count += 1;
                    format!("{:?}", previous).to_lowercase()
                }
                None => "unknown".to_string(),
            };
        }
        let mut metadata = Metadata::new();
        metadata.insert("previous_state".to_string(), json!(previous_state));
        metadata.insert("contributions_discarded".to_string(), json!(discarded));
        self.append(Event::new(EventPayload::DeliberationRestarted {
            workflow_id: workflow_id.to_string(),
            reason: reason.to_string(),
            metadata,
        }))
        .await;
    }

    /// Terminate a workflow, computing the final per-agent credit
    /// distribution into the terminal event's metadata.
    pub async fn complete_workflow(&self, workflow_id: &str, success: bool, result: Option<Value>) {
        let mut metadata = Metadata::new();
        {
            let mut state = self.state.lock().await;
            let mut final_credits: HashMap<String, f64> = HashMap::new();
            let mut total_contributions = 0usize;
            if let Some(contributions) = state.contributions.get(workflow_id) {
                total_contributions = contributions.len();
                for contribution in contributions {
                    *final_credits.entry(contribution.agent_id.clone()).or_default() +=
                        contribution.influence_score;
                }
            }
            if let Some(workflow) = state.workflows.get_mut(workflow_id) {
                workflow.state = if success {
                    WorkflowStatus::Completed
                } else {
                    WorkflowStatus::Failed
                };
                let duration = Utc::now().signed_duration_since(workflow.started_at);
                metadata.insert(
                    "duration_seconds".to_string(),
                    json!(duration.num_milliseconds() as f64 / 1000.0),
                );
                metadata.insert("restart_count".to_string(), json!(workflow.restart_count));
            }
            metadata.insert("total_contributions".to_string(), json!(total_contributions));
            metadata.insert("final_credits".to_string(), json!(final_credits));
        }
        if let Some(result) = result {
            metadata.insert("result".to_string(), result);
        }
        let payload = if success {
            EventPayload::WorkflowCompleted {
                workflow_id: workflow_id.to_string(),
                success,
                metadata,
            }
        } else {
            EventPayload::WorkflowFailed {
                workflow_id: workflow_id.to_string(),
                metadata,
            }
        };
        self.append(Event::new(payload)).await;
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.state.lock().await.workflows.get(workflow_id).cloned()
    }

    pub async fn contributions(&self, workflow_id: &str) -> Vec<AgentContribution> {
        self.state
            .lock()
            .await
            .contributions
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn agent_report(&self, agent_id: &str) -> AgentReport {
        let state = self.state.lock().await;
        let totals = state.agent_totals.get(agent_id).cloned().unwrap_or_default();
        let denominator = totals.total_contributions.max(1) as f64;
        AgentReport {
            agent_id: agent_id.to_string(),
            total_contributions: totals.total_contributions,
            successful_contributions: totals.successful_contributions,
            success_rate: totals.successful_contributions as f64 / denominator,
            total_influence: totals.total_influence,
            average_influence: totals.total_influence / denominator,
            lazy_flags: totals.lazy_flags,
            restart_triggers: totals.restart_triggers,
        }
    }

    pub async fn workflow_report(&self, workflow_id: &str) -> Option<WorkflowReport> {
        let state = self.state.lock().await;
        let workflow = state.workflows.get(workflow_id)?;
        let contributions = state
            .contributions
            .get(workflow_id)
            .map(|c| c.as_slice())
            .unwrap_or_default();
        let mut agent_stats: HashMap<String, WorkflowAgentStats> = HashMap::new();
        for contribution in contributions {
            let stats = agent_stats.entry(contribution.agent_id.clone()).or_default();
            stats.contributions += 1;
            stats.influence += contribution.influence_score;
            if contribution.success {
                stats.successes += 1;
            }
        }
        Some(WorkflowReport {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow.workflow_type.clone(),
            state: workflow.state,
            agents: workflow.agents.clone(),
            started_at: workflow.started_at,
            restart_count: workflow.restart_count,
            total_contributions: contributions.len(),
            agent_stats,
        })
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut by_kind: HashMap<String, usize> = EventKind::ALL
            .iter()
            .map(|k| (k.as_str().to_string(), 0))
            .collect();
        let mut recent = 0usize;
        for event in &state.events {
            *by_kind.entry(event.kind().as_str().to_string()).or_default() += 1;
            if now.signed_duration_since(event.ts) < ChronoDuration::hours(1) {
                recent += 1;
            }
        }
        StoreStats {
            total_events: state.events.len(),
            by_kind,
            recent_events: recent,
            dropped_events: self.dropped.load(Ordering::Relaxed),
            active_workflows: state
                .workflows
                .values()
                .filter(|w| w.state == WorkflowStatus::Running)
                .count(),
            completed_workflows: state
                .workflows
                .values()
                .filter(|w| w.state == WorkflowStatus::Completed)
                .count(),
            failed_workflows: state
                .workflows
                .values()
                .filter(|w| w.state == WorkflowStatus::Failed)
                .count(),
            agent_count: state.agent_totals.len(),
            total_contributions: state.agent_totals.values().map(|t| t.total_contributions).sum(),
            lazy_agent_flags: state.agent_totals.values().map(|t| t.lazy_flags).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::ActionType;

    fn route_event(source: &str, target: &str, success: bool) -> Event {
        Event::new(EventPayload::RouteCalled {
            source_service: source.to_string(),
            target_service: target.to_string(),
            method: "Process".to_string(),
            success,
            metadata: Metadata::new(),
        })
    }

    fn contribution(agent: &str, workflow: &str, influence: f64, success: bool) -> AgentContribution {
        AgentContribution {
            agent_id: agent.to_string(),
            workflow_id: workflow.to_string(),
            turn: 1,
            action_type: ActionType::Contribution,
            latency_ms: 10.0,
            success,
            influence_score: influence,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ring_keeps_most_recent_events_in_order() {
        let store = EventStore::new(5);
        for i in 0..8 {
            store.append(route_event(&format!("s{}", i), "t", true)).await;
        }
        let events = store.get_events(EventFilter::default()).await;
        assert_eq!(events.len(), 5);
        assert_eq!(store.dropped_events(), 3);
        let sources: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::RouteCalled { source_service, .. } => Some(source_service.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(sources, vec!["s3", "s4", "s5", "s6", "s7"]);
    }

    #[tokio::test]
    async fn ring_at_capacity_evicts_exactly_one_per_append() {
        let store = EventStore::new(3);
        for i in 0..3 {
            store.append(route_event(&format!("s{}", i), "t", true)).await;
        }
        assert_eq!(store.dropped_events(), 0);
        store.append(route_event("s3", "t", true)).await;
        assert_eq!(store.dropped_events(), 1);
        assert_eq!(store.get_events(EventFilter::default()).await.len(), 3);
    }

    #[tokio::test]
    async fn filters_compose() {
        let store = EventStore::new(100);
        store.append(route_event("a", "b", true)).await;
        store.append(route_event("a", "c", false)).await;
        store
            .append(Event::new(EventPayload::WorkflowStarted {
                workflow_id: "w1".to_string(),
                metadata: Metadata::new(),
            }))
            .await;

        let routes = store
            .get_events(EventFilter {
                kind: Some(EventKind::RouteCalled),
                ..Default::default()
            })
            .await;
        assert_eq!(routes.len(), 2);

        let to_c = store.get_route_events(None, Some("c"), 10).await;
        assert_eq!(to_c.len(), 1);

        let by_workflow = store
            .get_events(EventFilter {
                workflow: Some("w1".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_workflow.len(), 1);
    }

    #[tokio::test]
    async fn contributions_accumulate_and_emit_events() {
        let store = EventStore::new(100);
        store
            .start_workflow("w1", "deliberation", vec!["a".to_string(), "b".to_string()], Metadata::new())
            .await;
        store.record_contribution(contribution("a", "w1", 1.5, true)).await.unwrap();
        store.record_contribution(contribution("a", "w1", 0.0, false)).await.unwrap();

        let report = store.agent_report("a").await;
        assert_eq!(report.total_contributions, 2);
        assert_eq!(report.successful_contributions, 1);
        assert!((report.total_influence - 1.5).abs() < 1e-9);

        let events = store
            .get_events(EventFilter {
                kind: Some(EventKind::AgentContribution),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn restart_discards_contributions_and_bumps_count() {
        let store = EventStore::new(100);
        store
            .start_workflow("w1", "deliberation", vec!["a".to_string()], Metadata::new())
            .await;
        store.record_contribution(contribution("a", "w1", 1.0, true)).await.unwrap();
        store.mark_restarted("w1", "agent a is dominating", Some("a")).await;

        assert!(store.contributions("w1").await.is_empty());
        let workflow = store.workflow("w1").await.unwrap();
        assert_eq!(workflow.restart_count, 1);
        assert_eq!(workflow.state, WorkflowStatus::Restarted);
        assert_eq!(store.agent_report("a").await.restart_triggers, 1);

        let restarts = store
            .get_events(EventFilter {
                kind: Some(EventKind::DeliberationRestarted),
                ..Default::default()
            })
            .await;
        assert_eq!(restarts.len(), 1);
    }

    #[tokio::test]
    async fn completed_workflow_rejects_new_contributions() {
        let store = EventStore::new(100);
        store
            .start_workflow("w1", "deliberation", vec!["a".to_string()], Metadata::new())
            .await;
        store.complete_workflow("w1", false, None).await;
        let err = store
            .record_contribution(contribution("a", "w1", 1.0, true))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn final_credits_summed_per_agent() {
        let store = EventStore::new(100);
        store
            .start_workflow("w1", "deliberation", vec!["a".to_string(), "b".to_string()], Metadata::new())
            .await;
        store.record_contribution(contribution("a", "w1", 1.0, true)).await.unwrap();
        store.record_contribution(contribution("a", "w1", 0.5, true)).await.unwrap();
        store.record_contribution(contribution("b", "w1", 0.25, true)).await.unwrap();
        store.complete_workflow("w1", true, None).await;

        let events = store
            .get_events(EventFilter {
                kind: Some(EventKind::WorkflowCompleted),
                ..Default::default()
            })
            .await;
        let metadata = match &events[0].payload {
            EventPayload::WorkflowCompleted { metadata, .. } => metadata,
            _ => unreachable!(),
        };
        assert_eq!(metadata["final_credits"]["a"], json!(1.5));
        assert_eq!(metadata["final_credits"]["b"], json!(0.25));
    }

    #[tokio::test]
    async fn stats_count_by_kind_and_workflow_state() {
        let store = EventStore::new(100);
        store
            .start_workflow("w1", "deliberation", vec!["a".to_string()], Metadata::new())
            .await;
        store.append(route_event("a", "b", true)).await;
        store.complete_workflow("w1", true, None).await;

        let stats = store.stats().await;
        assert_eq!(stats.by_kind["route_called"], 1);
        assert_eq!(stats.by_kind["workflow_started"], 1);
        assert_eq!(stats.completed_workflows, 1);
        assert_eq!(stats.active_workflows, 0);
    }
}
