//! Rolling-window lazy/dominant agent detection.
//!
//! Each agent keeps the most recent `W` influence scores. Classification
//! compares the agent's window mean against the global mean across all
//! tracked agents:
//!
//! - ratio below the lazy threshold        -> lazy
//! - ratio above the threshold's inverse   -> dominant
//! - ratio below 0.5                       -> degraded
//! - otherwise                             -> healthy
//!
//! Agents with no recorded samples are `starting` and never count against
//! a workflow.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Health of an agent as seen by the credit engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealthStatus {
    Healthy,
    Degraded,
    Lazy,
    Dominant,
    Recovering,
    Starting,
}

/// Sliding-window influence tracker.
#[derive(Debug)]
pub struct LazyAgentDetector {
    window_size: usize,
    lazy_threshold: f64,
    history: HashMap<String, VecDeque<f64>>,
}

impl LazyAgentDetector {
    pub fn new(window_size: usize, lazy_threshold: f64) -> Self {
        Self {
            window_size,
            lazy_threshold,
            history: HashMap::new(),
        }
    }

    /// Record one influence score for an agent, evicting the oldest sample
    /// once the window is full.
    pub fn record(&mut self, agent_id: &str, influence_score: f64) {
        let window = self.history.entry(agent_id.to_string()).or_default();
        window.push_back(influence_score);
        while window.len() > self.window_size {
            window.pop_front();
        }
    }

    /// Drop an agent's history (after deregistration).
    pub fn forget(&mut self, agent_id: &str) {
        self.history.remove(agent_id);
    }

    fn window_mean(&self, agent_id: &str) -> Option<f64> {
        let window = self.history.get(agent_id)?;
        if window.is_empty() {
            return None;
        }
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }

    /// Mean of per-agent window means across every tracked agent.
    fn global_mean(&self) -> Option<f64> {
        let means: Vec<f64> = self
            .history
            .values()
            .filter(|w| !w.is_empty())
            .map(|w| w.iter().sum::<f64>() / w.len() as f64)
            .collect();
        if means.is_empty() {
            return None;
        }
        Some(means.iter().sum::<f64>() / means.len() as f64)
    }

    /// Classify one agent against the population.
    pub fn analyze(&self, agent_id: &str) -> AgentHealthStatus {
        let mean = match self.window_mean(agent_id) {
            Some(mean) => mean,
            None => return AgentHealthStatus::Starting,
        };
        let global = match self.global_mean() {
            Some(global) if global > 0.0 => global,
            // Zero or unknown population mean: the ratio is undefined, so
            // nobody is singled out.
            _ => return AgentHealthStatus::Healthy,
        };
        let ratio = mean / global;
        if ratio < self.lazy_threshold {
            AgentHealthStatus::Lazy
        } else if ratio > 1.0 / self.lazy_threshold {
            AgentHealthStatus::Dominant
        } else if ratio < 0.5 {
            AgentHealthStatus::Degraded
        } else {
            AgentHealthStatus::Healthy
        }
    }

    /// The subset of `agents` currently classified lazy.
    pub fn lazy_agents(&self, agents: &[String]) -> Vec<String> {
        agents
            .iter()
            .filter(|a| self.analyze(a) == AgentHealthStatus::Lazy)
            .cloned()
            .collect()
    }

    /// The first of `agents` classified dominant, if any.
    pub fn dominant_agent(&self, agents: &[String]) -> Option<String> {
        agents
            .iter()
            .find(|a| self.analyze(a) == AgentHealthStatus::Dominant)
            .cloned()
    }

    pub fn sample_count(&self, agent_id: &str) -> usize {
        self.history.get(agent_id).map(|w| w.len()).unwrap_or(0)
    }
}
