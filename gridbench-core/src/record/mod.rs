//! Coordinator side: cluster-wide merge of node acks, the test record, and
//! the repeat decision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    cluster::NodeId,
    stage::{Ack, AckPayload},
    stats::Measurements,
};

/// Outcome of one round as seen by the repeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum StageResult {
    /// Repeat predicate satisfied; the repeat loop ends normally.
    Success,
    /// Predicate not satisfied; run another round with the same test name.
    Break,
    /// At least one node reported an error; the repeat loop halts.
    Fail,
}

/// One recorded entry in a test's history. Per-node granularity is kept
/// regardless of the node-side merge policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestIteration<S> {
    /// Optional scalar label (e.g. the varied parameter of this iteration).
    pub value: Option<String>,
    pub node_stats: BTreeMap<NodeId, Vec<S>>,
}

impl<S> TestIteration<S> {
    fn empty() -> Self {
        Self {
            value: None,
            node_stats: BTreeMap::new(),
        }
    }
}

/// A named test and its ordered iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord<S> {
    name: String,
    iterations: Vec<TestIteration<S>>,
}

impl<S> TestRecord<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            iterations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iterations(&self) -> &[TestIteration<S>] {
        &self.iterations
    }

    fn iteration_mut(&mut self, index: usize) -> &mut TestIteration<S> {
        while self.iterations.len() <= index {
            self.iterations.push(TestIteration::empty());
        }
        &mut self.iterations[index]
    }

    /// Appends or updates the iteration at `index` with one node's bundles.
    pub fn add_stats(&mut self, index: usize, node: NodeId, stats: Vec<S>) {
        self.iteration_mut(index).node_stats.insert(node, stats);
    }

    pub fn set_iteration_value(&mut self, index: usize, value: String) {
        self.iteration_mut(index).value = Some(value);
    }
}

/// Merges every node's report into the named test's current iteration and
/// decides whether the benchmark repeats.
#[derive(Debug)]
pub struct ClusterAggregator<S> {
    tests: BTreeMap<String, TestRecord<S>>,
}

impl<S: Measurements> Default for ClusterAggregator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Measurements> ClusterAggregator<S> {
    pub fn new() -> Self {
        Self {
            tests: BTreeMap::new(),
        }
    }

    pub fn test(&self, name: &str) -> Option<&TestRecord<S>> {
        self.tests.get(name)
    }

    /// Processes all node acks of one round.
    ///
    /// Any error ack fails the round without touching the test record. The
    /// cluster-wide fold of all reported bundles is handed to the repeat
    /// predicate only; the record keeps per-node granularity.
    pub fn process_acks(
        &mut self,
        test_name: &str,
        acks: Vec<Ack<S>>,
        iteration_value: Option<String>,
        repeat_done: impl FnOnce(Option<&S>) -> bool,
    ) -> StageResult {
        for ack in &acks {
            if let AckPayload::Error(message) = &ack.payload {
                tracing::error!(node = %ack.node, message, "node reported an error; round failed");
                return StageResult::Fail;
            }
        }

        let mut reported: Vec<(NodeId, Vec<S>)> = Vec::new();
        for ack in acks {
            match ack.payload {
                AckPayload::Stats(stats) => reported.push((ack.node, stats)),
                AckPayload::Empty => {
                    tracing::debug!(node = %ack.node, "no statistics received from node");
                }
                AckPayload::Error(_) => unreachable!("error acks fail the round above"),
            }
        }

        let aggregated = crate::stats::merge_all(
            reported
                .iter()
                .flat_map(|(_, stats)| stats.iter().cloned()),
        );

        if !reported.is_empty() {
            let record = self
                .tests
                .entry(test_name.to_owned())
                .or_insert_with(|| TestRecord::new(test_name));
            let index = record.iterations().len();
            for (node, stats) in reported {
                record.add_stats(index, node, stats);
            }
            if let Some(value) = iteration_value {
                record.set_iteration_value(index, value);
            }
        }

        if repeat_done(aggregated.as_ref()) {
            StageResult::Success
        } else {
            StageResult::Break
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stats::{BasicStats, Measurements as _, Operation, OperationSample};

    fn bundle(requests: u64) -> BasicStats {
        let mut stats = BasicStats::new();
        for _ in 0..requests {
            stats.record(&OperationSample {
                operation: Operation::from_static("op"),
                duration: Duration::from_millis(1),
                ok: true,
            });
        }
        stats
    }

    fn stats_ack(node: usize, bundles: Vec<BasicStats>) -> Ack<BasicStats> {
        Ack {
            node: NodeId(node),
            payload: AckPayload::Stats(bundles),
        }
    }

    #[test]
    fn error_ack_fails_the_round_without_recording() {
        let mut aggregator = ClusterAggregator::new();
        let acks = vec![
            stats_ack(0, vec![bundle(5)]),
            Ack {
                node: NodeId(1),
                payload: AckPayload::Error("boom".into()),
            },
        ];
        let result = aggregator.process_acks("t", acks, None, |_| true);
        assert_eq!(result, StageResult::Fail);
        assert!(aggregator.test("t").is_none());
    }

    #[test]
    fn iterations_append_in_order_and_keep_node_granularity() {
        let mut aggregator = ClusterAggregator::new();

        let first = aggregator.process_acks(
            "t",
            vec![
                stats_ack(0, vec![bundle(3), bundle(4)]),
                stats_ack(1, vec![bundle(5)]),
            ],
            Some("iter-0".into()),
            |_| true,
        );
        assert_eq!(first, StageResult::Success);

        let second = aggregator.process_acks(
            "t",
            vec![stats_ack(0, vec![bundle(1)]), stats_ack(1, vec![bundle(2)])],
            None,
            |_| true,
        );
        assert_eq!(second, StageResult::Success);

        let record = aggregator.test("t").unwrap();
        assert_eq!(record.iterations().len(), 2);

        let iteration = &record.iterations()[0];
        assert_eq!(iteration.value.as_deref(), Some("iter-0"));
        assert_eq!(iteration.node_stats[&NodeId(0)].len(), 2);
        assert_eq!(iteration.node_stats[&NodeId(1)].len(), 1);
    }

    #[test]
    fn repeat_predicate_decides_success_or_break() {
        let mut aggregator = ClusterAggregator::new();

        // cluster-wide fold: 3 + 4 + 5 = 12 requests
        let result = aggregator.process_acks(
            "t",
            vec![
                stats_ack(0, vec![bundle(3), bundle(4)]),
                stats_ack(1, vec![bundle(5)]),
            ],
            None,
            |aggregated| aggregated.unwrap().total_requests() >= 12,
        );
        assert_eq!(result, StageResult::Success);

        let result = aggregator.process_acks(
            "t",
            vec![stats_ack(0, vec![bundle(1)])],
            None,
            |aggregated| aggregated.unwrap().total_requests() >= 12,
        );
        assert_eq!(result, StageResult::Break);

        // break still recorded a new iteration for the next round
        assert_eq!(aggregator.test("t").unwrap().iterations().len(), 2);
    }

    #[test]
    fn empty_acks_do_not_create_an_iteration() {
        let mut aggregator = ClusterAggregator::new();
        let result = aggregator.process_acks(
            "t",
            vec![
                Ack::<BasicStats> {
                    node: NodeId(0),
                    payload: AckPayload::Empty,
                },
                Ack {
                    node: NodeId(1),
                    payload: AckPayload::Empty,
                },
            ],
            None,
            |aggregated| aggregated.is_none(),
        );
        assert_eq!(result, StageResult::Success);
        assert!(aggregator.test("t").is_none());
    }
}
