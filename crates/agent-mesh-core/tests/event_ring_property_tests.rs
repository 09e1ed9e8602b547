//! Property tests for the bounded event ring and the Shapley efficiency
//! axiom.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use agent_mesh_core::credit::ShapleyCalculator;
use agent_mesh_core::events::{Event, EventFilter, EventPayload, EventStore, Metadata};

fn marker_event(sequence: usize) -> Event {
    Event::new(EventPayload::WorkflowStarted {
        workflow_id: format!("w-{}", sequence),
        metadata: Metadata::new(),
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any append sequence of length L into a ring of capacity N, the
    /// store holds min(L, N) events: the most recent ones, in order.
    #[test]
    fn ring_holds_the_most_recent_events(
        capacity in 1usize..32,
        appended in 0usize..96,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let store = Arc::new(EventStore::new(capacity));
            for sequence in 0..appended {
                store.append(marker_event(sequence)).await;
            }
            let events = store
                .get_events(EventFilter {
                    limit: Some(capacity),
                    ..Default::default()
                })
                .await;
            prop_assert_eq!(events.len(), appended.min(capacity));

            let first_kept = appended.saturating_sub(capacity);
            let ids: Vec<String> = events
                .iter()
                .filter_map(|e| e.workflow_id().map(|w| w.to_string()))
                .collect();
            let expected: Vec<String> =
                (first_kept..appended).map(|s| format!("w-{}", s)).collect();
            prop_assert_eq!(ids, expected);

            let dropped = store.dropped_events() as usize;
            prop_assert_eq!(dropped, appended.saturating_sub(capacity));
            Ok(())
        })?;
    }

    /// Efficiency axiom: for any coalition value function over n <= 6
    /// agents, the Shapley values sum to v(A) - v(empty).
    #[test]
    fn shapley_values_satisfy_efficiency(
        n in 1usize..=6,
        values in prop::collection::vec(-10.0f64..10.0, 64),
    ) {
        let agents: Vec<String> = (0..n).map(|i| format!("a{}", i)).collect();
        // Index a coalition by its membership bitmask into the generated
        // value table.
        let value = move |coalition: &HashSet<&str>| -> f64 {
            let mut mask = 0usize;
            for (i, agent) in agents.iter().enumerate() {
                if coalition.contains(agent.as_str()) {
                    mask |= 1 << i;
                }
            }
            values[mask]
        };
        let agents: Vec<String> = (0..n).map(|i| format!("a{}", i)).collect();
        let calculator = ShapleyCalculator::new(10, 1000);
        let total: f64 = agents
            .iter()
            .map(|a| calculator.marginal_contribution(a, &agents, &value))
            .sum();
        let grand_coalition: HashSet<&str> = agents.iter().map(|a| a.as_str()).collect();
        let expected = value(&grand_coalition) - value(&HashSet::new());
        prop_assert!((total - expected).abs() <= 1e-9, "total={} expected={}", total, expected);
    }
}
