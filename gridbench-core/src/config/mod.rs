//! Stage configuration surface.
//!
//! The values are injected by an outer configuration layer; this module only
//! defines the knobs and the fail-fast validation that runs before any
//! stressor is spawned.

use std::time::Duration;

use crate::error::ConfigError;

/// How many stressor threads the test runs, expressed either per node or as
/// a cluster-wide total. Exactly one of the two must be set (non-zero).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadConfig {
    /// Number of threads executing on each participating node.
    pub threads_per_node: usize,
    /// Total number of threads across the whole cluster.
    pub total_threads: usize,
}

impl ThreadConfig {
    pub fn per_node(threads: usize) -> Self {
        Self {
            threads_per_node: threads,
            total_threads: 0,
        }
    }

    pub fn total(threads: usize) -> Self {
        Self {
            threads_per_node: 0,
            total_threads: threads,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.threads_per_node, self.total_threads) {
            (0, 0) => Err(ConfigError::NoThreadCount),
            (0, _) | (_, 0) => Ok(()),
            _ => Err(ConfigError::ConflictingThreadCounts),
        }
    }
}

/// When the current round ends: after the cluster has issued a fixed number
/// of operations, or after a fixed wall-clock duration on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTarget {
    /// Cluster-wide operation count, split across participating nodes.
    Operations(u64),
    /// Wall-clock duration, identical on every node, measured from round
    /// start.
    Duration(Duration),
}

/// Per-thread request pacing. `think_time` and `cycle_time` are mutually
/// exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacingConfig {
    /// Fixed idle delay after each operation.
    pub think_time: Option<Duration>,
    /// Intended inter-arrival time between operations. The next issue time
    /// is scheduled from the previous intended time, not from completion,
    /// compensating for coordinated omission.
    pub cycle_time: Option<Duration>,
    /// Record the unqueued service time instead of the client-observed
    /// latency. Only valid together with `cycle_time`.
    pub report_latency_as_service_time: bool,
}

impl PacingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.think_time.is_some() && self.cycle_time.is_some() {
            return Err(ConfigError::ConflictingPacing);
        }
        if self.report_latency_as_service_time && self.cycle_time.is_none() {
            return Err(ConfigError::ServiceTimeWithoutCycleTime);
        }
        Ok(())
    }
}

/// Whether operations are explicitly wrapped in transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    Never,
    Always,
    /// Wrap only when the target resource reports itself transactional and
    /// the transaction size is positive.
    #[default]
    IfTransactional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionConfig {
    pub mode: TransactionMode,
    /// Number of operations per transaction.
    pub transaction_size: usize,
    /// Commit (true) or roll back (false) each transaction.
    pub commit_transactions: bool,
    /// Log commit/rollback failures at error severity instead of debug.
    pub log_transaction_exceptions: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            mode: TransactionMode::IfTransactional,
            transaction_size: 1,
            commit_transactions: true,
            log_transaction_exceptions: true,
        }
    }
}

impl TransactionConfig {
    /// Per-call resolution of the wrap decision for the target resource.
    pub fn wrap(&self, resource_is_transactional: bool) -> bool {
        match self.mode {
            TransactionMode::Never => false,
            TransactionMode::Always => true,
            TransactionMode::IfTransactional => {
                resource_is_transactional && self.transaction_size > 0
            }
        }
    }
}

/// Full configuration of one benchmark stage on one node.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Name of the test the round's results are recorded under. Also the
    /// node-local key a detached round is registered under.
    pub test_name: String,
    /// Name of the target resource, handed to the transactional capability.
    pub resource: String,
    pub threads: ThreadConfig,
    pub target: CompletionTarget,
    pub transactions: TransactionConfig,
    pub pacing: PacingConfig,
    /// Startup delay absorbing thread-creation jitter; operations issued
    /// during ramp-up are not recorded.
    pub ramp_up: Duration,
    /// Ceiling on the wait for round completion. Exceeding it terminates the
    /// fleet through the normal completion path.
    pub timeout: Option<Duration>,
    /// Local threads synchronize on starting each round of requests.
    pub synchronous_requests: bool,
    /// Fold this node's per-thread bundles into one before reporting.
    pub merge_thread_stats: bool,
    /// Start the fleet and return immediately; a later await stage consumes
    /// the running round.
    pub run_background: bool,
}

impl StageConfig {
    pub fn new(test_name: impl Into<String>, target: CompletionTarget) -> Self {
        Self {
            test_name: test_name.into(),
            resource: String::new(),
            threads: ThreadConfig::default(),
            target,
            transactions: TransactionConfig::default(),
            pacing: PacingConfig::default(),
            ramp_up: Duration::ZERO,
            timeout: None,
            synchronous_requests: false,
            merge_thread_stats: false,
            run_background: false,
        }
    }

    /// Fail-fast validation, run before any thread starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.threads.validate()?;
        self.pacing.validate()?;
        Ok(())
    }
}

/// Human-friendly duration parser for configuration values.
///
/// Accepts the usual humantime forms ("500ms", "1m 30s") plus underscores as
/// separators ("1m_30s").
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let parsed = if raw.contains('_') {
        humantime::parse_duration(&raw.replace('_', " "))
    } else {
        humantime::parse_duration(raw)
    };
    parsed.map_err(|_| ConfigError::InvalidDuration(raw.to_owned()))
}
