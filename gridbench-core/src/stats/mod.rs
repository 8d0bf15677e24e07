//! Measurement bundles.
//!
//! The execution core treats a bundle as an opaque value: stressors record
//! into it, nodes and the coordinator fold bundles together with an
//! associative, commutative merge. `BasicStats` is the reference
//! implementation shipped with the crate.

use std::{borrow::Cow, collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};


/// Tag identifying one kind of operation, used to bucket measurements.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Operation(Cow<'static, str>);

impl Operation {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One completed operation as observed by a stressor.
#[derive(Debug, Clone)]
pub struct OperationSample {
    pub operation: Operation,
    /// Client-observed latency relative to the intended issue time, or the
    /// unqueued service time when service-time reporting is enabled.
    pub duration: Duration,
    pub ok: bool,
}

/// A mergeable measurement bundle.
///
/// Each stressor owns exactly one bundle; no cross-thread writes. `merge`
/// must be associative and commutative so per-node and cluster-wide folds
/// produce the same result in any order.
pub trait Measurements: Clone + Send + 'static {
    fn record(&mut self, sample: &OperationSample);
    fn merge(&mut self, other: &Self);
}

/// Fold any number of bundles into one. `None` when the input is empty.
pub fn merge_all<S, I>(bundles: I) -> Option<S>
where
    S: Measurements,
    I: IntoIterator<Item = S>,
{
    let mut iter = bundles.into_iter();
    let mut merged = iter.next()?;
    for bundle in iter {
        merged.merge(&bundle);
    }
    Some(merged)
}

/// Per-operation counters for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStats {
    pub requests: u64,
    pub errors: u64,
    /// Sum of recorded durations, for mean latency.
    pub total_nanos: u64,
    pub min_nanos: u64,
    pub max_nanos: u64,
}

impl OpStats {
    fn from_sample(sample: &OperationSample) -> Self {
        let nanos = duration_nanos(sample.duration);
        Self {
            requests: 1,
            errors: if sample.ok { 0 } else { 1 },
            total_nanos: nanos,
            min_nanos: nanos,
            max_nanos: nanos,
        }
    }

    fn absorb(&mut self, other: &Self) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.total_nanos = self.total_nanos.saturating_add(other.total_nanos);
        self.min_nanos = self.min_nanos.min(other.min_nanos);
        self.max_nanos = self.max_nanos.max(other.max_nanos);
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.requests == 0 {
            return None;
        }
        Some(Duration::from_nanos(self.total_nanos / self.requests))
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Reference measurement bundle: request/error counts and a latency envelope
/// per operation tag. Ordered map so the encoded form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicStats {
    ops: BTreeMap<Operation, OpStats>,
}

impl BasicStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(&self, operation: &Operation) -> Option<&OpStats> {
        self.ops.get(operation)
    }

    pub fn operations(&self) -> impl Iterator<Item = (&Operation, &OpStats)> {
        self.ops.iter()
    }

    pub fn total_requests(&self) -> u64 {
        self.ops.values().map(|op| op.requests).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.ops.values().map(|op| op.errors).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Measurements for BasicStats {
    fn record(&mut self, sample: &OperationSample) {
        self.ops
            .entry(sample.operation.clone())
            .and_modify(|op| op.absorb(&OpStats::from_sample(sample)))
            .or_insert_with(|| OpStats::from_sample(sample));
    }

    fn merge(&mut self, other: &Self) {
        for (operation, stats) in &other.ops {
            self.ops
                .entry(operation.clone())
                .and_modify(|op| op.absorb(stats))
                .or_insert(*stats);
        }
    }
}
