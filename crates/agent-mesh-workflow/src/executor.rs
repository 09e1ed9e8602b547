//! Async workflow execution.
//!
//! Execution is a forward traversal from `__start__` over a shared,
//! execution-scoped state. Parallel edges fork concurrent branches; a
//! branch that reaches a fan-in node whose other inputs are still pending
//! parks, and the last-arriving branch carries the traversal forward, so
//! every node executes exactly once. Fallback edges catch node errors;
//! conditional edges are evaluated in priority order against the current
//! output and global state.
//!
//! Each node's object output is folded into `global_state` as it
//! completes, so downstream predicates and the terminal result see the
//! accumulated data of the whole run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agent_mesh_core::config::WorkflowConfig;
use agent_mesh_core::credit::{ContributionReport, CreditEngine};
use agent_mesh_core::error::MeshError;
use agent_mesh_core::events::{ActionType, EventStore, Metadata};

use crate::graph::{
    AggregationStrategy, EdgeContext, EdgeType, NodeType, WorkflowGraph, WorkflowNode, END_NODE,
    START_NODE,
};

/// Invokes a mesh service on behalf of an agent or tool node.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(
        &self,
        service_name: &str,
        method: &str,
        input: Value,
        timeout: Duration,
    ) -> Result<Value, MeshError>;
}

/// Rolling execution counters for one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub executions: u64,
    pub successes: u64,
    pub total_latency_ms: f64,
}

impl NodeStats {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.total_latency_ms / self.executions as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.successes as f64 / self.executions as f64
    }
}

/// State threaded through one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub execution_id: String,
    /// Nodes currently executing (parallel branches).
    pub current_nodes: HashSet<String>,
    /// Parallel-fork targets claimed ahead of their branch starting.
    pub scheduled_nodes: HashSet<String>,
    pub completed_nodes: HashSet<String>,
    pub node_outputs: HashMap<String, Value>,
    pub global_state: Map<String, Value>,
    pub node_stats: HashMap<String, NodeStats>,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl WorkflowState {
    fn new(workflow_id: &str, execution_id: &str, initial_input: Value) -> Self {
        let mut node_outputs = HashMap::new();
        node_outputs.insert(START_NODE.to_string(), initial_input.clone());
        let mut global_state = Map::new();
        global_state.insert("input".to_string(), initial_input);
        Self {
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            current_nodes: HashSet::new(),
            scheduled_nodes: HashSet::new(),
            completed_nodes: HashSet::new(),
            node_outputs,
            global_state,
            node_stats: HashMap::new(),
            started_at: Utc::now(),
            error: None,
        }
    }
}

/// Outcome of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_id: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub completed_nodes: Vec<String>,
    pub duration: Duration,
    pub state: WorkflowState,
}

type SharedState = Arc<Mutex<WorkflowState>>;

/// Executes validated workflow graphs.
pub struct WorkflowExecutor {
    config: WorkflowConfig,
    invoker: Option<Arc<dyn ServiceInvoker>>,
    store: Option<Arc<EventStore>>,
    credit: Option<Arc<CreditEngine>>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl WorkflowExecutor {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            invoker: None,
            store: None,
            credit: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn ServiceInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn with_store(mut self, store: Arc<EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_credit(mut self, credit: Arc<CreditEngine>) -> Self {
        self.credit = Some(credit);
        self
    }

    /// Execute a graph to completion (or failure) under the configured
    /// whole-workflow deadline.
    pub async fn execute(&self, graph: &WorkflowGraph, initial_input: Value) -> ExecutionResult {
        self.execute_with_id(graph, initial_input, &Uuid::new_v4().to_string())
            .await
    }

    /// Cancel a running execution. The execution fails with reason
    /// "cancelled" and no further contributions are recorded against it.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        match self.active.lock().await.get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn active_executions(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    pub async fn execute_with_id(
        &self,
        graph: &WorkflowGraph,
        initial_input: Value,
        execution_id: &str,
    ) -> ExecutionResult {
        let started = Instant::now();
        if let Err(err) = graph.validate() {
            return ExecutionResult {
                success: false,
                execution_id: execution_id.to_string(),
                result: None,
                error: Some(err.to_string()),
                completed_nodes: Vec::new(),
                duration: started.elapsed(),
                state: WorkflowState::new(&graph.workflow_id, execution_id, initial_input),
            };
        }

        let state: SharedState = Arc::new(Mutex::new(WorkflowState::new(
            &graph.workflow_id,
            execution_id,
            initial_input,
        )));
        let services = graph.participating_services();
        if let Some(store) = &self.store {
            let mut metadata = Metadata::new();
            metadata.insert("execution_id".to_string(), json!(execution_id));
            store
                .start_workflow(&graph.workflow_id, &graph.name, services.clone(), metadata)
                .await;
        }
        if let Some(credit) = &self.credit {
            credit.register_workflow(&graph.workflow_id, services).await;
        }

        let token = CancellationToken::new();
        self.active
            .lock()
            .await
            .insert(execution_id.to_string(), token.clone());

        let outcome = tokio::time::timeout(
            self.config.workflow_timeout,
            self.advance(graph, state.clone(), START_NODE.to_string(), token.clone()),
        )
        .await;

        self.active.lock().await.remove(execution_id);
        if let Some(credit) = &self.credit {
            credit.unregister_workflow(&graph.workflow_id).await;
        }

        let (success, result, error) = match outcome {
            Ok(Ok(Some(result))) => (true, Some(result), None),
            Ok(Ok(None)) => (
                false,
                None,
                Some("execution stalled before reaching the end node".to_string()),
            ),
            Ok(Err(err)) => {
                let reason = if token.is_cancelled() {
                    "cancelled".to_string()
                } else {
                    err.to_string()
                };
                (false, None, Some(reason))
            }
            Err(_) => (false, None, Some("timeout".to_string())),
        };

        let final_state = {
            let mut guard = state.lock().await;
            guard.error = error.clone();
            guard.clone()
        };
        if let Some(store) = &self.store {
            store
                .complete_workflow(
                    &graph.workflow_id,
                    success,
                    result.clone().or_else(|| error.clone().map(|e| json!({ "error": e }))),
                )
                .await;
        }

        ExecutionResult {
            success,
            execution_id: execution_id.to_string(),
            result,
            error,
            completed_nodes: final_state.completed_nodes.iter().cloned().collect(),
            duration: started.elapsed(),
            state: final_state,
        }
    }

    /// Advance the traversal at `node_id`. Returns `Ok(Some(result))` from
    /// the branch that reaches the end node, `Ok(None)` from branches that
    /// park at a fan-in (or find their node already taken).
    fn advance<'a>(
        &'a self,
        graph: &'a WorkflowGraph,
        state: SharedState,
        node_id: String,
        token: CancellationToken,
    ) -> BoxFuture<'a, Result<Option<Value>, MeshError>> {
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(MeshError::internal("cancelled"));
            }
            let node = graph
                .node(&node_id)
                .ok_or_else(|| MeshError::UnknownNode {
                    node_id: node_id.clone(),
                })?;

            // Fan-in barrier and claim. A node with pending predecessors
            // parks this branch; the predecessor finishing last carries on.
            {
                let mut guard = state.lock().await;
                if guard.completed_nodes.contains(&node_id)
                    || guard.current_nodes.contains(&node_id)
                {
                    return Ok(None);
                }
                let predecessors = graph.predecessors(&node_id);
                if predecessors.len() > 1 {
                    let pending: Vec<&str> = predecessors
                        .iter()
                        .filter(|p| !guard.completed_nodes.contains(**p))
                        .copied()
                        .collect();
                    if !pending.is_empty() && will_still_run(graph, &guard, &pending) {
                        return Ok(None);
                    }
                }
                guard.scheduled_nodes.remove(&node_id);
                guard.current_nodes.insert(node_id.clone());
            }

            let input = {
                let guard = state.lock().await;
                node_input(graph, &guard, &node_id)
            };

            let execution_started = Instant::now();
            let execution = self.execute_node(node, &state, input).await;
            let latency_ms = execution_started.elapsed().as_secs_f64() * 1000.0;

            match execution {
                Ok(output) => {
                    let turn = {
                        let mut guard = state.lock().await;
                        let stats = guard.node_stats.entry(node_id.clone()).or_default();
                        stats.executions += 1;
                        stats.successes += 1;
                        stats.total_latency_ms += latency_ms;
                        let turn = stats.executions as u32;
                        guard.node_outputs.insert(node_id.clone(), output.clone());
                        if node.node_type != NodeType::Start && node.node_type != NodeType::End {
                            if let Value::Object(fields) = &output {
                                for (key, value) in fields {
                                    guard.global_state.insert(key.clone(), value.clone());
                                }
                            }
                        }
                        guard.current_nodes.remove(&node_id);
                        guard.completed_nodes.insert(node_id.clone());
                        turn
                    };
                    self.record_contribution(graph, node, turn, latency_ms, true)
                        .await;

                    if node.node_type == NodeType::End {
                        let guard = state.lock().await;
                        return Ok(Some(Value::Object(guard.global_state.clone())));
                    }
                    self.dispatch_edges(graph, state, node_id, output, token).await
                }
                Err(err) => {
                    {
                        let mut guard = state.lock().await;
                        let stats = guard.node_stats.entry(node_id.clone()).or_default();
                        stats.executions += 1;
                        stats.total_latency_ms += latency_ms;
                        guard.current_nodes.remove(&node_id);
                    }
                    let turn = {
                        let guard = state.lock().await;
                        guard
                            .node_stats
                            .get(&node_id)
                            .map(|s| s.executions as u32)
                            .unwrap_or(1)
                    };
                    self.record_contribution(graph, node, turn, latency_ms, false)
                        .await;

                    if let Some(fallback) = graph.fallback_target(&node_id) {
                        tracing::warn!(
                            node = %node_id,
                            fallback = %fallback,
                            error = %err,
                            "node failed; taking fallback edge"
                        );
                        return self
                            .advance(graph, state, fallback.to_string(), token)
                            .await;
                    }
                    Err(err)
                }
            }
        })
    }

    /// Follow the node's outgoing edges (already sorted by priority).
    async fn dispatch_edges(
        &self,
        graph: &WorkflowGraph,
        state: SharedState,
        node_id: String,
        output: Value,
        token: CancellationToken,
    ) -> Result<Option<Value>, MeshError> {
        let parallel_targets: Vec<String> = graph
            .parallel_targets(&node_id)
            .into_iter()
            .map(|t| t.to_string())
            .collect();
        if !parallel_targets.is_empty() {
            // Claim every branch root before starting any of them, so a
            // fast branch sees its siblings as pending at the fan-in.
            {
                let mut guard = state.lock().await;
                for target in &parallel_targets {
                    guard.scheduled_nodes.insert(target.clone());
                }
            }
            let branches = parallel_targets.iter().map(|target| {
                self.advance(graph, state.clone(), target.clone(), token.clone())
            });
            let results = join_all(branches).await;

            {
                let mut guard = state.lock().await;
                let outputs: Vec<Value> = parallel_targets
                    .iter()
                    .map(|t| guard.node_outputs.get(t).cloned().unwrap_or(Value::Null))
                    .collect();
                guard
                    .global_state
                    .insert("parallel_results".to_string(), Value::Array(outputs));
            }

            let mut first_error = None;
            for result in results {
                match result {
                    Ok(Some(value)) => return Ok(Some(value)),
                    Ok(None) => {}
                    Err(err) => first_error = first_error.or(Some(err)),
                }
            }
            return match first_error {
                Some(err) => Err(err),
                None => Ok(None),
            };
        }

        for edge in graph.edges_from(&node_id) {
            match edge.edge_type {
                EdgeType::Sequential => {
                    return self
                        .advance(graph, state, edge.target.clone(), token)
                        .await;
                }
                EdgeType::Conditional => {
                    let fires = {
                        let guard = state.lock().await;
                        let context = EdgeContext {
                            current_output: &output,
                            global_state: &guard.global_state,
                            node_outputs: &guard.node_outputs,
                        };
                        edge.condition.as_ref().map(|c| c(&context)).unwrap_or(false)
                    };
                    if fires {
                        return self
                            .advance(graph, state, edge.target.clone(), token)
                            .await;
                    }
                }
                // Fallback edges only fire on error; parallel handled above.
                EdgeType::Fallback | EdgeType::Parallel => {}
            }
        }
        // No edge fired (all conditions false): the branch ends here.
        Ok(Some(output))
    }

    async fn execute_node(
        &self,
        node: &WorkflowNode,
        state: &SharedState,
        input: Value,
    ) -> Result<Value, MeshError> {
        match node.node_type {
            NodeType::Agent | NodeType::Tool => match &node.service_name {
                Some(service_name) => {
                    let invoker = self.invoker.as_ref().ok_or_else(|| {
                        MeshError::internal(format!(
                            "node {} needs a service invoker",
                            node.node_id
                        ))
                    })?;
                    let timeout = if node.timeout.is_zero() {
                        self.config.node_timeout
                    } else {
                        node.timeout
                    };
                    tokio::time::timeout(
                        timeout,
                        invoker.invoke(service_name, "Process", input, timeout),
                    )
                    .await
                    .map_err(|_| MeshError::DeadlineExceeded {
                        operation: format!("node {}", node.node_id),
                    })?
                }
                None => Ok(input),
            },
            NodeType::Aggregator => Ok(aggregate(node.aggregation(), input)),
            NodeType::Checkpoint => {
                let mut guard = state.lock().await;
                let snapshot = Value::Object(guard.global_state.clone());
                guard.global_state.insert(
                    format!("checkpoint_{}", node.node_id),
                    json!({
                        "timestamp": Utc::now().to_rfc3339(),
                        "state": snapshot,
                    }),
                );
                Ok(input)
            }
            NodeType::Router | NodeType::Human | NodeType::Start | NodeType::End => Ok(input),
        }
    }

    async fn record_contribution(
        &self,
        graph: &WorkflowGraph,
        node: &WorkflowNode,
        turn: u32,
        latency_ms: f64,
        success: bool,
    ) {
        let (credit, service_name) = match (&self.credit, &node.service_name) {
            (Some(credit), Some(service_name)) => (credit, service_name),
            _ => return,
        };
        let report = ContributionReport {
            agent_id: service_name.clone(),
            workflow_id: graph.workflow_id.clone(),
            turn,
            action_type: ActionType::Contribution,
            latency_ms,
            success,
            influence: None,
        };
        if let Err(err) = credit.record_contribution(report).await {
            tracing::debug!(
                node = %node.node_id,
                error = %err,
                "contribution not recorded"
            );
        }
    }
}

/// True when some pending predecessor can still complete: it is claimed,
/// scheduled, or reachable from a node that is.
fn will_still_run(graph: &WorkflowGraph, state: &WorkflowState, pending: &[&str]) -> bool {
    let mut live: HashSet<&str> = HashSet::new();
    live.extend(state.current_nodes.iter().map(|s| s.as_str()));
    live.extend(state.scheduled_nodes.iter().map(|s| s.as_str()));
    if live.is_empty() {
        return false;
    }
    // BFS over forward edges from every live node.
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: Vec<&str> = live.iter().copied().collect();
    while let Some(node) = queue.pop() {
        if !reachable.insert(node) {
            continue;
        }
        for edge in graph.edges_from(node) {
            if edge.edge_type != EdgeType::Fallback {
                queue.push(edge.target.as_str());
            }
        }
    }
    pending.iter().any(|p| reachable.contains(*p))
}

/// Input for a node: its completed predecessors' outputs (single one
/// unwrapped, several keyed by predecessor id), or the workflow input.
fn node_input(graph: &WorkflowGraph, state: &WorkflowState, node_id: &str) -> Value {
    let completed: Vec<&str> = graph
        .predecessors(node_id)
        .into_iter()
        .filter(|p| state.completed_nodes.contains(*p))
        .collect();
    match completed.len() {
        0 => state.global_state.get("input").cloned().unwrap_or(Value::Null),
        1 => state
            .node_outputs
            .get(completed[0])
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Object(
            completed
                .into_iter()
                .map(|p| {
                    (
                        p.to_string(),
                        state.node_outputs.get(p).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect(),
        ),
    }
}

/// Combine a multi-predecessor input map per the aggregation strategy.
fn aggregate(strategy: AggregationStrategy, input: Value) -> Value {
    let map = match input {
        Value::Object(map) => map,
        other => return other,
    };
    match strategy {
        AggregationStrategy::Merge => {
            let mut merged = Map::new();
            for (key, value) in map {
                match value {
                    Value::Object(fields) => merged.extend(fields),
                    other => {
                        merged.insert(key, other);
                    }
                }
            }
            Value::Object(merged)
        }
        AggregationStrategy::List => Value::Array(map.into_values().collect()),
        AggregationStrategy::First => map
            .into_values()
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null),
    }
}
