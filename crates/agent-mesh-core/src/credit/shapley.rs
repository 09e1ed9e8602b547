//! Shapley-value credit assignment.
//!
//! For a workflow with agent set `A` and coalition value function
//! `v: 2^A -> R`, the Shapley value of agent `i` is
//!
//! ```text
//! phi_i = sum over S subset of A\{i} of
//!         |S|! * (|A|-|S|-1)! / |A|! * (v(S + {i}) - v(S))
//! ```
//!
//! The exact sum is exponential in `|A|`, so it is only used up to a
//! configured agent cap; larger coalitions fall back to Monte-Carlo
//! permutation sampling with a caller-visible sample budget.

use std::collections::HashSet;

use rand::seq::SliceRandom;

use crate::events::ActionType;

/// Coalition value function: maps a set of agent ids to a real value.
pub type CoalitionValueFn<'a> = dyn Fn(&HashSet<&str>) -> f64 + Send + Sync + 'a;

/// Shapley marginal-contribution calculator.
#[derive(Debug, Clone)]
pub struct ShapleyCalculator {
    /// Exact enumeration is used while `|A|` stays at or below this cap.
    exact_agent_cap: usize,
    /// Permutation samples drawn above the cap.
    sample_budget: usize,
}

impl ShapleyCalculator {
    pub fn new(exact_agent_cap: usize, sample_budget: usize) -> Self {
        Self {
            exact_agent_cap,
            sample_budget,
        }
    }

    /// Marginal contribution of `agent_id` within `agents` under `value`.
    ///
    /// Chooses the exact path or the sampler based on the agent count.
    pub fn marginal_contribution(
        &self,
        agent_id: &str,
        agents: &[String],
        value: &CoalitionValueFn<'_>,
    ) -> f64 {
        if agents.is_empty() || !agents.iter().any(|a| a == agent_id) {
            return 0.0;
        }
        if agents.len() <= self.exact_agent_cap {
            self.exact(agent_id, agents, value)
        } else {
            self.monte_carlo(agent_id, agents, value)
        }
    }

    /// Exact Shapley value by enumerating every subset of `A \ {i}`.
    fn exact(&self, agent_id: &str, agents: &[String], value: &CoalitionValueFn<'_>) -> f64 {
        let others: Vec<&str> = agents
            .iter()
            .map(|a| a.as_str())
            .filter(|a| *a != agent_id)
            .collect();
        let n = agents.len();
        let factorial_n = factorial(n);

        let mut shapley = 0.0;
        // Bitmask enumeration over subsets of the other agents.
        for mask in 0u64..(1u64 << others.len()) {
            let coalition: HashSet<&str> = others
                .iter()
                .enumerate()
                .filter(|(idx, _)| mask & (1 << idx) != 0)
                .map(|(_, a)| *a)
                .collect();
            let s = coalition.len();
            let weight = factorial(s) * factorial(n - s - 1) / factorial_n;

            let mut with_agent = coalition.clone();
            with_agent.insert(agent_id);

            shapley += weight * (value(&with_agent) - value(&coalition));
        }
        shapley
    }

    /// Monte-Carlo estimate: average the marginal contribution of
    /// `agent_id` over random orderings of the agent set.
    fn monte_carlo(&self, agent_id: &str, agents: &[String], value: &CoalitionValueFn<'_>) -> f64 {
        let mut rng = rand::thread_rng();
        let mut ordering: Vec<&str> = agents.iter().map(|a| a.as_str()).collect();
        let mut total = 0.0;
        for _ in 0..self.sample_budget {
            ordering.shuffle(&mut rng);
            let mut prefix: HashSet<&str> = HashSet::new();
            for member in &ordering {
                if *member == agent_id {
                    break;
                }
                prefix.insert(member);
            }
            let before = value(&prefix);
            prefix.insert(agent_id);
            let after = value(&prefix);
            total += after - before;
        }
        total / self.sample_budget as f64
    }

    /// Default influence heuristic used when no value function is supplied:
    /// base score 1 on success, 0 on failure, scaled by the action weight.
    pub fn heuristic_influence(action_type: ActionType, success: bool) -> f64 {
        let base = if success { 1.0 } else { 0.0 };
        base * action_type.influence_weight()
    }
}

fn factorial(n: usize) -> f64 {
    (1..=n).fold(1.0, |acc, k| acc * k as f64)
}
