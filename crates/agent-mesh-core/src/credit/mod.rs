//! Credit assignment and lazy-agent detection.
//!
//! - [`ShapleyCalculator`] scores marginal contributions (exact enumeration
//!   for small coalitions, Monte-Carlo sampling above the cap).
//! - [`LazyAgentDetector`] classifies agents from rolling influence windows.
//! - [`CreditEngine`] ties both to the event store and arbitrates
//!   deliberation restarts.

mod detector;
mod engine;
mod shapley;

pub use detector::{AgentHealthStatus, LazyAgentDetector};
pub use engine::{
    AgentMetrics, ContributionReport, CreditEngine, CreditStats, RestartDecision, WorkflowHealth,
};
pub use shapley::{CoalitionValueFn, ShapleyCalculator};
