//! Credit assignment, agent health tracking, and restart arbitration.
//!
//! The engine sits between contribution producers (the workflow engine,
//! health probes) and the event store. It scores every contribution
//! (explicit score, Shapley value, or the action-type heuristic), keeps
//! rolling per-agent metrics, and on each tick decides whether any active
//! deliberation has degenerated badly enough to warrant a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use super::detector::{AgentHealthStatus, LazyAgentDetector};
use super::shapley::{CoalitionValueFn, ShapleyCalculator};
use crate::config::LazyDetectionConfig;
use crate::error::MeshError;
use crate::events::{ActionType, AgentContribution, EventStore, Metadata};

/// Weight of the newest response-time sample in the rolling average.
const RESPONSE_TIME_EWMA_ALPHA: f64 = 0.1;

/// Window for counting restarts against the hourly budget.
const RESTART_BUDGET_WINDOW: Duration = Duration::from_secs(3600);

/// One reported unit of agent work, before scoring.
#[derive(Debug, Clone)]
pub struct ContributionReport {
    pub agent_id: String,
    pub workflow_id: String,
    pub turn: u32,
    pub action_type: ActionType,
    pub latency_ms: f64,
    pub success: bool,
    /// Explicit influence score. When absent the engine scores the
    /// contribution itself.
    pub influence: Option<f64>,
}

/// Rolling per-agent performance metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub contribution_count: u64,
    pub successful_count: u64,
    pub total_influence: f64,
    pub consecutive_failures: u32,
    /// Exponentially weighted moving average of response time.
    pub avg_response_time_ms: f64,
    pub lazy_flags: u64,
    pub health_status: AgentHealthStatus,
}

impl AgentMetrics {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            contribution_count: 0,
            successful_count: 0,
            total_influence: 0.0,
            consecutive_failures: 0,
            avg_response_time_ms: 0.0,
            lazy_flags: 0,
            health_status: AgentHealthStatus::Starting,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.contribution_count == 0 {
            return 0.0;
        }
        self.successful_count as f64 / self.contribution_count as f64
    }

    pub fn avg_influence(&self) -> f64 {
        if self.contribution_count == 0 {
            return 0.0;
        }
        self.total_influence / self.contribution_count as f64
    }

    fn record_sample(&mut self, latency_ms: f64, success: bool) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        if self.avg_response_time_ms == 0.0 {
            self.avg_response_time_ms = latency_ms;
        } else {
            self.avg_response_time_ms = self.avg_response_time_ms
                * (1.0 - RESPONSE_TIME_EWMA_ALPHA)
                + latency_ms * RESPONSE_TIME_EWMA_ALPHA;
        }
    }
}

/// Health view of one active workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHealth {
    pub workflow_id: String,
    pub agents: Vec<String>,
    /// Summed influence per agent since the last restart.
    pub contribution_balance: HashMap<String, f64>,
    pub lazy_agents: Vec<String>,
    pub dominant_agent: Option<String>,
    pub restart_count: u32,
    pub health_score: f64,
}

impl WorkflowHealth {
    fn new(workflow_id: &str, agents: Vec<String>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            agents,
            contribution_balance: HashMap::new(),
            lazy_agents: Vec::new(),
            dominant_agent: None,
            restart_count: 0,
            health_score: 1.0,
        }
    }
}

/// Outcome of one restart arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartDecision {
    pub workflow_id: String,
    pub reason: String,
}

/// System-wide credit health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditStats {
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub lazy_agents: usize,
    pub dominant_agents: usize,
    pub active_workflows: usize,
    pub total_restarts: u32,
    pub system_health_score: f64,
}

struct CreditState {
    metrics: HashMap<String, AgentMetrics>,
    detector: LazyAgentDetector,
    workflows: HashMap<String, WorkflowHealth>,
    restart_history: HashMap<String, Vec<Instant>>,
}

/// The credit assignment and restart-arbitration engine.
pub struct CreditEngine {
    store: Arc<EventStore>,
    config: LazyDetectionConfig,
    shapley: ShapleyCalculator,
    state: Mutex<CreditState>,
}

impl CreditEngine {
    pub fn new(store: Arc<EventStore>, config: LazyDetectionConfig) -> Self {
        let shapley = ShapleyCalculator::new(
            config.shapley_exact_agent_cap,
            config.shapley_sample_budget,
        );
        let detector = LazyAgentDetector::new(config.window_size, config.lazy_threshold);
        Self {
            store,
            config,
            shapley,
            state: Mutex::new(CreditState {
                metrics: HashMap::new(),
                detector,
                workflows: HashMap::new(),
                restart_history: HashMap::new(),
            }),
        }
    }

    pub fn shapley(&self) -> &ShapleyCalculator {
        &self.shapley
    }

    /// Track a workflow for health analysis.
    pub async fn register_workflow(&self, workflow_id: &str, agents: Vec<String>) {
        let mut state = self.state.lock().await;
        state
            .workflows
            .insert(workflow_id.to_string(), WorkflowHealth::new(workflow_id, agents));
    }

    /// Stop tracking a workflow (terminal states keep their store record).
    pub async fn unregister_workflow(&self, workflow_id: &str) {
        let mut state = self.state.lock().await;
        state.workflows.remove(workflow_id);
    }

    /// Score and record a contribution using the default heuristic (or the
    /// report's explicit score).
    pub async fn record_contribution(
        &self,
        report: ContributionReport,
    ) -> Result<AgentContribution, MeshError> {
        let influence = report.influence.unwrap_or_else(|| {
            ShapleyCalculator::heuristic_influence(report.action_type, report.success)
        });
        self.record_scored(report, influence).await
    }

    /// Score a contribution with a caller-provided coalition value
    /// function. The coalition is the workflow's registered agent set
    /// (falling back to the agents seen so far plus the reporter).
    pub async fn record_contribution_with_value(
        &self,
        report: ContributionReport,
        value: &CoalitionValueFn<'_>,
    ) -> Result<AgentContribution, MeshError> {
        let agents = {
            let state = self.state.lock().await;
            match state.workflows.get(&report.workflow_id) {
                Some(health) if !health.agents.is_empty() => health.agents.clone(),
                _ => {
                    let mut seen: Vec<String> = self
                        .store
                        .contributions(&report.workflow_id)
                        .await
                        .into_iter()
                        .map(|c| c.agent_id)
                        .collect();
                    seen.push(report.agent_id.clone());
                    seen.sort();
                    seen.dedup();
                    seen
                }
            }
        };
        let influence = self
            .shapley
            .marginal_contribution(&report.agent_id, &agents, value);
        self.record_scored(report, influence).await
    }

    async fn record_scored(
        &self,
        report: ContributionReport,
        influence: f64,
    ) -> Result<AgentContribution, MeshError> {
        let contribution = AgentContribution {
            agent_id: report.agent_id.clone(),
            workflow_id: report.workflow_id.clone(),
            turn: report.turn,
            action_type: report.action_type,
            latency_ms: report.latency_ms,
            success: report.success,
            influence_score: influence,
            ts: Utc::now(),
        };
        // The store enforces the workflow lifecycle; only a successful
        // append updates the rolling windows.
        self.store.record_contribution(contribution.clone()).await?;

        let mut state = self.state.lock().await;
        let metrics = state
            .metrics
            .entry(report.agent_id.clone())
            .or_insert_with(|| AgentMetrics::new(&report.agent_id));
        metrics.contribution_count += 1;
        if report.success {
            metrics.successful_count += 1;
        }
        metrics.total_influence += influence;
        metrics.record_sample(report.latency_ms, report.success);
        state.detector.record(&report.agent_id, influence);
        if let Some(health) = state.workflows.get_mut(&report.workflow_id) {
            *health
                .contribution_balance
                .entry(report.agent_id.clone())
                .or_default() += influence;
        }
        Ok(contribution)
    }

    /// Feed a health-probe response-time sample into the agent's EWMA
    /// without counting it as a workflow contribution.
    pub async fn record_probe_sample(&self, agent_id: &str, latency_ms: f64, success: bool) {
        let mut state = self.state.lock().await;
        let metrics = state
            .metrics
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentMetrics::new(agent_id));
        metrics.record_sample(latency_ms, success);
    }

    /// Forget an agent entirely (after deregistration).
    pub async fn forget_agent(&self, agent_id: &str) {
        let mut state = self.state.lock().await;
        state.metrics.remove(agent_id);
        state.detector.forget(agent_id);
    }

    /// One analysis pass: reclassify agents, refresh workflow health, and
    /// arbitrate restarts. Returns the restarts that were carried out.
    pub async fn tick(&self) -> Vec<RestartDecision> {
        let mut newly_lazy: Vec<(String, u64)> = Vec::new();
        let mut decisions: Vec<(RestartDecision, Option<String>)> = Vec::new();
        {
            let mut state = self.state.lock().await;

            // Reclassify every tracked agent.
            let agent_ids: Vec<String> = state.metrics.keys().cloned().collect();
            for agent_id in agent_ids {
                let status = state.detector.analyze(&agent_id);
                let metrics = state
                    .metrics
                    .get_mut(&agent_id)
                    .unwrap_or_else(|| unreachable!("agent id taken from the metrics map"));
                let previous = metrics.health_status;
                // A recovering agent holds that status until it earns a
                // non-lazy classification again.
                if previous == AgentHealthStatus::Recovering && status == AgentHealthStatus::Lazy {
                    continue;
                }
                metrics.health_status = status;
                if previous != AgentHealthStatus::Lazy && status == AgentHealthStatus::Lazy {
                    metrics.lazy_flags += 1;
                    newly_lazy.push((agent_id.clone(), metrics.lazy_flags));
                }
            }

            // Refresh workflow health and evaluate restart conditions.
            let workflow_ids: Vec<String> = state.workflows.keys().cloned().collect();
            for workflow_id in workflow_ids {
                let lazy;
                let agents;
                {
                    let health = match state.workflows.get(&workflow_id) {
                        Some(health) => health,
                        None => continue,
                    };
                    agents = health.agents.clone();
                    lazy = state.detector.lazy_agents(&agents);
                }

                let healthy = agents
                    .iter()
                    .filter(|a| {
                        matches!(
                            state
                                .metrics
                                .get(*a)
                                .map(|m| m.health_status)
                                .unwrap_or(AgentHealthStatus::Starting),
                            AgentHealthStatus::Healthy | AgentHealthStatus::Starting
                        )
                    })
                    .count();
                let health_score = if agents.is_empty() {
                    1.0
                } else {
                    healthy as f64 / agents.len() as f64
                };

                let health = state
                    .workflows
                    .get_mut(&workflow_id)
                    .unwrap_or_else(|| unreachable!("workflow id taken from the map"));
                health.lazy_agents = lazy;
                health.health_score = health_score;

                // Dominance is judged on the influence balance, not the
                // cross-workflow windows: one agent holding more than the
                // configured share of this workflow's cumulative influence.
                let total_influence: f64 = health.contribution_balance.values().sum();
                health.dominant_agent = if total_influence > 0.0 {
                    health
                        .contribution_balance
                        .iter()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .filter(|(_, score)| **score / total_influence > self.config.dominance_threshold)
                        .map(|(agent, _)| agent.clone())
                } else {
                    None
                };

                let reason = evaluate_restart(health, total_influence, &self.config);
                if let Some(reason) = reason {
                    if Self::can_restart(
                        &mut state.restart_history,
                        &workflow_id,
                        &self.config,
                    ) {
                        state
                            .restart_history
                            .entry(workflow_id.clone())
                            .or_default()
                            .push(Instant::now());
                        let health = state
                            .workflows
                            .get_mut(&workflow_id)
                            .unwrap_or_else(|| unreachable!("workflow id taken from the map"));
                        health.restart_count += 1;
                        health.contribution_balance.clear();
                        let triggered_by = health.dominant_agent.clone();
                        // Lazy agents get a fresh start.
                        for agent in health.lazy_agents.clone() {
                            if let Some(metrics) = state.metrics.get_mut(&agent) {
                                metrics.health_status = AgentHealthStatus::Recovering;
                            }
                        }
                        decisions.push((
                            RestartDecision {
                                workflow_id: workflow_id.clone(),
                                reason,
                            },
                            triggered_by,
                        ));
                    } else {
                        tracing::warn!(
                            workflow_id = %workflow_id,
                            reason = %reason,
                            "restart suppressed by rate limit"
                        );
                    }
                }
            }
        }

        // Emit derived events outside the engine lock.
        for (agent_id, lazy_flags) in newly_lazy {
            let mut metadata = Metadata::new();
            metadata.insert("lazy_count".to_string(), json!(lazy_flags));
            metadata.insert("threshold".to_string(), json!(self.config.lazy_threshold));
            self.store.flag_lazy_agent(&agent_id, None, metadata).await;
        }
        for (decision, triggered_by) in &decisions {
            self.store
                .mark_restarted(
                    &decision.workflow_id,
                    &decision.reason,
                    triggered_by.as_deref(),
                )
                .await;
        }
        decisions.into_iter().map(|(decision, _)| decision).collect()
    }

    fn can_restart(
        restart_history: &mut HashMap<String, Vec<Instant>>,
        workflow_id: &str,
        config: &LazyDetectionConfig,
    ) -> bool {
        let now = Instant::now();
        let history = restart_history.entry(workflow_id.to_string()).or_default();
        history.retain(|at| now.duration_since(*at) < RESTART_BUDGET_WINDOW);
        if history.len() >= config.max_restarts_per_hour {
            return false;
        }
        match history.last() {
            Some(last) => now.duration_since(*last) >= config.restart_cooldown,
            None => true,
        }
    }

    pub async fn agent_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.state.lock().await.metrics.get(agent_id).cloned()
    }

    pub async fn agent_status(&self, agent_id: &str) -> AgentHealthStatus {
        let state = self.state.lock().await;
        state
            .metrics
            .get(agent_id)
            .map(|m| m.health_status)
            .unwrap_or(AgentHealthStatus::Starting)
    }

    pub async fn workflow_health(&self, workflow_id: &str) -> Option<WorkflowHealth> {
        self.state.lock().await.workflows.get(workflow_id).cloned()
    }

    pub async fn stats(&self) -> CreditStats {
        let state = self.state.lock().await;
        let count_status = |status: AgentHealthStatus| {
            state
                .metrics
                .values()
                .filter(|m| m.health_status == status)
                .count()
        };
        let healthy = count_status(AgentHealthStatus::Healthy);
        CreditStats {
            total_agents: state.metrics.len(),
            healthy_agents: healthy,
            lazy_agents: count_status(AgentHealthStatus::Lazy),
            dominant_agents: count_status(AgentHealthStatus::Dominant),
            active_workflows: state.workflows.len(),
            total_restarts: state.workflows.values().map(|w| w.restart_count).sum(),
            system_health_score: healthy as f64 / state.metrics.len().max(1) as f64,
        }
    }
}

/// The three restart conditions, checked in order.
fn evaluate_restart(
    health: &WorkflowHealth,
    total_influence: f64,
    config: &LazyDetectionConfig,
) -> Option<String> {
    if let Some(dominant) = &health.dominant_agent {
        let share = health
            .contribution_balance
            .get(dominant)
            .copied()
            .unwrap_or(0.0)
            / total_influence;
        return Some(format!(
            "agent {} is dominating the deliberation ({:.1}% of influence)",
            dominant,
            share * 100.0
        ));
    }
    if !health.agents.is_empty()
        && health.lazy_agents.len() as f64 > health.agents.len() as f64 * 0.5
    {
        return Some(format!(
            "too many lazy agents: {}/{}",
            health.lazy_agents.len(),
            health.agents.len()
        ));
    }
    if health.health_score < 0.3 {
        return Some(format!(
            "low workflow health score: {:.2}",
            health.health_score
        ));
    }
    None
}
