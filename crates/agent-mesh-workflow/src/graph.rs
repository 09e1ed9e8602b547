//! Workflow graphs: typed nodes and edges over string ids.
//!
//! Edges reference nodes by id, never by pointer; adjacency and
//! reverse-adjacency are id-to-id maps, so traversal costs a lookup per
//! step and the graph owns no cycles. Every graph carries the implicit
//! `__start__` and `__end__` nodes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use agent_mesh_core::error::MeshError;

/// Id of the implicit entry node.
pub const START_NODE: &str = "__start__";

/// Id of the implicit exit node.
pub const END_NODE: &str = "__end__";

/// What a node does when the traversal reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Invokes a mesh service.
    Agent,
    /// External tool integration; invoked like an agent when a service
    /// name is attached, pass-through otherwise.
    Tool,
    /// Pass-through; the routing logic lives on its outgoing edges.
    Router,
    /// Combines predecessor outputs per its aggregation strategy.
    Aggregator,
    /// Snapshots the global state for recovery.
    Checkpoint,
    /// Human-in-the-loop placeholder; pass-through.
    Human,
    Start,
    End,
}

/// How an edge is traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Always taken (the first one, by priority).
    Sequential,
    /// Taken when its predicate holds; first match wins.
    Conditional,
    /// All parallel edges are taken; their subgraphs run concurrently.
    Parallel,
    /// Consulted only when the source node fails.
    Fallback,
}

/// How an aggregator combines predecessor outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Dict-merge every object input.
    Merge,
    /// Collect inputs as a list.
    List,
    /// First non-null input.
    First,
}

/// Inputs available to a conditional edge's predicate.
pub struct EdgeContext<'a> {
    pub current_output: &'a Value,
    pub global_state: &'a Map<String, Value>,
    pub node_outputs: &'a HashMap<String, Value>,
}

/// Predicate deciding whether a conditional edge fires.
pub type EdgeCondition = Arc<dyn Fn(&EdgeContext<'_>) -> bool + Send + Sync>;

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub node_id: String,
    pub name: String,
    pub node_type: NodeType,
    /// Mesh service invoked by agent/tool nodes.
    pub service_name: Option<String>,
    pub config: Map<String, Value>,
    pub timeout: Duration,
    pub retries: u32,
}

impl WorkflowNode {
    pub fn new(node_id: &str, node_type: NodeType) -> Self {
        Self {
            node_id: node_id.to_string(),
            name: node_id.to_string(),
            node_type,
            service_name: None,
            config: Map::new(),
            timeout: Duration::from_secs(30),
            retries: 3,
        }
    }

    pub fn with_service(mut self, service_name: &str) -> Self {
        self.service_name = Some(service_name.to_string());
        self
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The aggregation strategy from `config.aggregation` (merge default).
    pub fn aggregation(&self) -> AggregationStrategy {
        match self.config.get("aggregation").and_then(|v| v.as_str()) {
            Some("list") => AggregationStrategy::List,
            Some("first") => AggregationStrategy::First,
            _ => AggregationStrategy::Merge,
        }
    }
}

/// An edge between two nodes.
#[derive(Clone)]
pub struct WorkflowEdge {
    pub edge_id: String,
    pub source: String,
    pub target: String,
    pub edge_type: EdgeType,
    pub condition: Option<EdgeCondition>,
    pub priority: i32,
}

impl std::fmt::Debug for WorkflowEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEdge")
            .field("edge_id", &self.edge_id)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("edge_type", &self.edge_type)
            .field("has_condition", &self.condition.is_some())
            .field("priority", &self.priority)
            .finish()
    }
}

/// A DAG of typed nodes and edges defining an execution plan.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub workflow_id: String,
    pub name: String,
    pub description: String,
    nodes: HashMap<String, WorkflowNode>,
    edges: HashMap<String, WorkflowEdge>,
    /// node id -> outgoing edge ids, in insertion order.
    adjacency: HashMap<String, Vec<String>>,
    /// node id -> incoming edge ids.
    reverse_adjacency: HashMap<String, Vec<String>>,
}

impl WorkflowGraph {
    pub fn new(workflow_id: &str, name: &str) -> Self {
        let mut graph = Self {
            workflow_id: workflow_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            adjacency: HashMap::new(),
            reverse_adjacency: HashMap::new(),
        };
        graph.add_node(WorkflowNode::new(START_NODE, NodeType::Start));
        graph.add_node(WorkflowNode::new(END_NODE, NodeType::End));
        graph
    }

    pub fn add_node(&mut self, node: WorkflowNode) {
        self.nodes.insert(node.node_id.clone(), node);
    }

    pub fn add_edge(
        &mut self,
        source: &str,
        target: &str,
        edge_type: EdgeType,
        condition: Option<EdgeCondition>,
        priority: i32,
    ) -> String {
        let edge_id = format!("{}_to_{}", source, target);
        let edge = WorkflowEdge {
            edge_id: edge_id.clone(),
            source: source.to_string(),
            target: target.to_string(),
            edge_type,
            condition,
            priority,
        };
        self.edges.insert(edge_id.clone(), edge);
        self.adjacency
            .entry(source.to_string())
            .or_default()
            .push(edge_id.clone());
        self.reverse_adjacency
            .entry(target.to_string())
            .or_default()
            .push(edge_id.clone());
        edge_id
    }

    /// Connect `__start__` to the first real node.
    pub fn set_entry_point(&mut self, node_id: &str) {
        self.add_edge(START_NODE, node_id, EdgeType::Sequential, None, 0);
    }

    /// Connect the last real node to `__end__`.
    pub fn set_exit_point(&mut self, node_id: &str) {
        self.add_edge(node_id, END_NODE, EdgeType::Sequential, None, 0);
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes.values()
    }

    /// Service names attached to agent/tool nodes, deduplicated.
    pub fn participating_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .nodes
            .values()
            .filter_map(|n| n.service_name.clone())
            .collect();
        services.sort();
        services.dedup();
        services
    }

    /// Outgoing edges sorted by priority (descending); ties keep insertion
    /// order.
    pub fn edges_from(&self, node_id: &str) -> Vec<&WorkflowEdge> {
        let mut edges: Vec<&WorkflowEdge> = self
            .adjacency
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| self.edges.get(id)).collect())
            .unwrap_or_default();
        edges.sort_by_key(|e| std::cmp::Reverse(e.priority));
        edges
    }

    /// Ids of nodes with an edge into `node_id`.
    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        self.reverse_adjacency
            .get(node_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.edges.get(id))
                    // Fallback edges are error paths, not data dependencies.
                    .filter(|e| e.edge_type != EdgeType::Fallback)
                    .map(|e| e.source.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Targets of the node's parallel edges.
    pub fn parallel_targets(&self, node_id: &str) -> Vec<&str> {
        self.edges_from(node_id)
            .into_iter()
            .filter(|e| e.edge_type == EdgeType::Parallel)
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Target of the node's fallback edge, if any.
    pub fn fallback_target(&self, node_id: &str) -> Option<&str> {
        self.edges_from(node_id)
            .into_iter()
            .find(|e| e.edge_type == EdgeType::Fallback)
            .map(|e| e.target.as_str())
    }

    /// Structural validation: exactly one start and end, no cycles, no
    /// dangling edges, no dead-end nodes, and a start-to-end path.
    pub fn validate(&self) -> Result<(), MeshError> {
        let starts = self
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::Start)
            .count();
        let ends = self
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::End)
            .count();
        if starts != 1 || ends != 1 {
            return Err(MeshError::InvalidGraph {
                message: format!("expected exactly one start and end node, got {}/{}", starts, ends),
            });
        }

        for edge in self.edges.values() {
            if !self.nodes.contains_key(&edge.source) {
                return Err(MeshError::UnknownNode {
                    node_id: edge.source.clone(),
                });
            }
            if !self.nodes.contains_key(&edge.target) {
                return Err(MeshError::UnknownNode {
                    node_id: edge.target.clone(),
                });
            }
        }

        for node_id in self.nodes.keys() {
            if node_id != END_NODE && self.adjacency.get(node_id).map_or(true, |e| e.is_empty()) {
                return Err(MeshError::InvalidGraph {
                    message: format!("node {} has no outgoing edges", node_id),
                });
            }
        }

        if self.has_cycle() {
            return Err(MeshError::CycleDetected);
        }

        if !self.reachable_from_start().contains(END_NODE) {
            return Err(MeshError::InvalidGraph {
                message: "no path from start to end".to_string(),
            });
        }

        Ok(())
    }

    fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut in_path = HashSet::new();

        fn dfs(
            graph: &WorkflowGraph,
            node: &str,
            visited: &mut HashSet<String>,
            in_path: &mut HashSet<String>,
        ) -> bool {
            visited.insert(node.to_string());
            in_path.insert(node.to_string());
            if let Some(edge_ids) = graph.adjacency.get(node) {
                for edge_id in edge_ids {
                    let target = match graph.edges.get(edge_id) {
                        Some(edge) => edge.target.as_str(),
                        None => continue,
                    };
                    if !visited.contains(target) {
                        if dfs(graph, target, visited, in_path) {
                            return true;
                        }
                    } else if in_path.contains(target) {
                        return true;
                    }
                }
            }
            in_path.remove(node);
            false
        }

        for node in self.nodes.keys() {
            if !visited.contains(node.as_str()) && dfs(self, node, &mut visited, &mut in_path) {
                return true;
            }
        }
        false
    }

    fn reachable_from_start(&self) -> HashSet<&str> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(START_NODE);
        while let Some(node) = queue.pop_front() {
            if reachable.insert(node) {
                if let Some(edge_ids) = self.adjacency.get(node) {
                    for edge_id in edge_ids {
                        if let Some(edge) = self.edges.get(edge_id) {
                            queue.push_back(edge.target.as_str());
                        }
                    }
                }
            }
        }
        reachable
    }
}

/// Fluent builder for linear-with-branches workflows.
pub struct WorkflowBuilder {
    graph: WorkflowGraph,
    last_node: Option<String>,
}

impl WorkflowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: WorkflowGraph::new(&Uuid::new_v4().to_string(), name),
            last_node: None,
        }
    }

    /// Append an agent node, chained after the previous one (or the entry
    /// point).
    pub fn add_agent(mut self, name: &str, service_name: &str) -> Self {
        self.graph
            .add_node(WorkflowNode::new(name, NodeType::Agent).with_service(service_name));
        match self.last_node.take() {
            Some(last) => {
                self.graph.add_edge(&last, name, EdgeType::Sequential, None, 0);
            }
            None => self.graph.set_entry_point(name),
        }
        self.last_node = Some(name.to_string());
        self
    }

    /// Append a router node whose conditional edges pick the next branch.
    pub fn add_router(mut self, name: &str, routes: Vec<(String, EdgeCondition)>) -> Self {
        self.graph.add_node(WorkflowNode::new(name, NodeType::Router));
        match self.last_node.take() {
            Some(last) => {
                self.graph.add_edge(&last, name, EdgeType::Sequential, None, 0);
            }
            None => self.graph.set_entry_point(name),
        }
        for (target, condition) in routes {
            self.graph
                .add_edge(name, &target, EdgeType::Conditional, Some(condition), 0);
        }
        // The chain forks here.
        self.last_node = None;
        self
    }

    /// Fan out from the previous node to all `targets` in parallel.
    pub fn add_parallel(mut self, targets: &[&str]) -> Self {
        let source = self.last_node.take().unwrap_or_else(|| START_NODE.to_string());
        for target in targets {
            self.graph
                .add_edge(&source, target, EdgeType::Parallel, None, 0);
        }
        self
    }

    /// Add an aggregator node with the given strategy.
    pub fn add_aggregator(mut self, name: &str, strategy: AggregationStrategy) -> Self {
        let mut config = Map::new();
        let strategy_name = match strategy {
            AggregationStrategy::Merge => "merge",
            AggregationStrategy::List => "list",
            AggregationStrategy::First => "first",
        };
        config.insert("aggregation".to_string(), Value::String(strategy_name.into()));
        self.graph
            .add_node(WorkflowNode::new(name, NodeType::Aggregator).with_config(config));
        self.last_node = Some(name.to_string());
        self
    }

    /// Add an arbitrary node without chaining it.
    pub fn add_node(mut self, node: WorkflowNode) -> Self {
        self.graph.add_node(node);
        self
    }

    /// Manually connect two nodes.
    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.graph.add_edge(source, target, EdgeType::Sequential, None, 0);
        self
    }

    pub fn connect_parallel(mut self, source: &str, target: &str) -> Self {
        self.graph.add_edge(source, target, EdgeType::Parallel, None, 0);
        self
    }

    /// Route `source` to `fallback` when `source` fails.
    pub fn set_fallback(mut self, source: &str, fallback: &str) -> Self {
        self.graph.add_edge(source, fallback, EdgeType::Fallback, None, 0);
        self
    }

    pub fn set_entry_point(mut self, node_id: &str) -> Self {
        self.graph.set_entry_point(node_id);
        self
    }

    pub fn set_exit_point(mut self, node_id: &str) -> Self {
        self.graph.set_exit_point(node_id);
        self
    }

    /// Close the chain into `__end__` and validate.
    pub fn build(mut self) -> Result<WorkflowGraph, MeshError> {
        if let Some(last) = self.last_node.take() {
            self.graph.set_exit_point(&last);
        }
        self.graph.validate()?;
        Ok(self.graph)
    }
}
