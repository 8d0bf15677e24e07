//! The stressor: one concurrent unit of load generation.
//!
//! Each stressor runs the pluggable workload logic in a loop, wraps
//! operations in transactions per policy, applies think-time or cycle-time
//! pacing, and records into its exclusively-owned measurement bundle. It
//! stops when the completion policy or the round's finish signal says so.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{Instant, sleep, sleep_until},
};

use crate::{
    completion::Completion,
    config::{StageConfig, TransactionConfig},
    error::BoxError,
    fleet::RoundHandle,
    pacing::{OperationPacer, Pace},
    stats::{Measurements, Operation, OperationSample},
};


/// Identity of one stressor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId {
    /// Index across the whole cluster; contiguous per node.
    pub global: usize,
    /// Index on this node.
    pub local: usize,
}

/// What the workload logic sees on every invocation.
#[derive(Debug, Clone)]
pub struct StressorContext {
    pub thread: ThreadId,
    /// Name of the target resource operations run against.
    pub resource: String,
}

/// Result of one workload invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Tag used to bucket the measurement.
    pub operation: Operation,
    pub ok: bool,
}

/// The workload-specific logic of one operation.
///
/// A failed operation is reported through [`Invocation::ok`]; returning an
/// error signals an unrecoverable condition that stops the thread.
pub trait OperationLogic: Send + 'static {
    /// Runs once before the stressor signals ready, so initialization cost
    /// is absorbed before ramp-up starts.
    fn init(&mut self, ctx: &StressorContext) -> Result<(), BoxError> {
        let _ = ctx;
        Ok(())
    }

    /// Performs one operation. May suspend arbitrarily (network I/O etc.).
    fn invoke(
        &mut self,
        ctx: &StressorContext,
    ) -> impl Future<Output = Result<Invocation, BoxError>> + Send;
}

/// Supplies one logic instance per stressor thread.
pub trait Workload: Send + Sync + 'static {
    type Logic: OperationLogic;

    fn logic(&self, thread: ThreadId) -> Self::Logic;
}

/// Transactional capability of the target resource.
pub trait Transactional: Send + Sync + 'static {
    fn is_transactional(&self, resource: &str) -> bool;

    fn begin(&self, resource: &str) -> impl Future<Output = Result<(), BoxError>> + Send;
    fn commit(&self, resource: &str) -> impl Future<Output = Result<(), BoxError>> + Send;
    fn rollback(&self, resource: &str) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Capability impl for targets without transaction support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonTransactional;

impl Transactional for NonTransactional {
    fn is_transactional(&self, _resource: &str) -> bool {
        false
    }

    async fn begin(&self, _resource: &str) -> Result<(), BoxError> {
        Ok(())
    }

    async fn commit(&self, _resource: &str) -> Result<(), BoxError> {
        Ok(())
    }

    async fn rollback(&self, _resource: &str) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Per-thread slice of the stage configuration.
#[derive(Debug, Clone)]
pub(crate) struct StressorConfig {
    pub resource: String,
    pub transactions: TransactionConfig,
    pub think_time: Option<Duration>,
    pub cycle_time: Option<Duration>,
    pub report_latency_as_service_time: bool,
}

impl StressorConfig {
    pub(crate) fn from_stage(config: &StageConfig) -> Self {
        Self {
            resource: config.resource.clone(),
            transactions: config.transactions,
            think_time: config.pacing.think_time,
            cycle_time: config.pacing.cycle_time,
            report_latency_as_service_time: config.pacing.report_latency_as_service_time,
        }
    }
}

/// Everything one round's stressors share.
#[derive(Clone)]
pub(crate) struct RoundContext {
    pub handle: Arc<RoundHandle>,
    pub completion: Arc<Completion>,
    pub pacer: Arc<OperationPacer>,
    pub config: Arc<StressorConfig>,
}

pub(crate) struct Stressor<L, T, S> {
    thread: ThreadId,
    logic: L,
    transactional: Arc<T>,
    stats: S,
    round: RoundContext,
}

impl<L, T, S> Stressor<L, T, S>
where
    L: OperationLogic,
    T: Transactional,
    S: Measurements,
{
    pub(crate) fn new(
        thread: ThreadId,
        logic: L,
        transactional: Arc<T>,
        stats: S,
        round: RoundContext,
    ) -> Self {
        Self {
            thread,
            logic,
            transactional,
            stats,
            round,
        }
    }

    /// The stressor task body. Signals `ready` once initialized and about to
    /// enter the loop; returns the owned measurement bundle on exit.
    pub(crate) async fn run(mut self, ready: mpsc::Sender<Result<(), BoxError>>) -> S {
        let ctx = StressorContext {
            thread: self.thread,
            resource: self.round.config.resource.clone(),
        };

        if let Err(err) = self.logic.init(&ctx) {
            let _ = ready.send(Err(err)).await;
            return self.stats;
        }
        let _ = ready.send(Ok(())).await;
        drop(ready);

        // Intended issue schedule for cycle-time pacing. Scheduling from the
        // previous intended time, never from completion, compensates for
        // coordinated omission.
        let mut next_intended = self.round.config.cycle_time.map(|_| Instant::now());

        loop {
            if self.round.handle.is_signalled() {
                break;
            }
            if self.round.completion.should_stop() {
                break;
            }
            if self.round.pacer.next(self.thread.local).await == Pace::Stop {
                break;
            }

            let wrap = self.round.config.transactions.wrap(
                self.transactional
                    .is_transactional(&self.round.config.resource),
            );

            if wrap
                && let Err(err) = self.transactional.begin(&ctx.resource).await
            {
                self.log_transaction_error("begin", &err);
                continue;
            }

            let ops_in_transaction = if wrap {
                self.round.config.transactions.transaction_size.max(1)
            } else {
                1
            };

            let mut fatal = false;
            for issued in 0..ops_in_transaction {
                if issued > 0
                    && (self.round.handle.is_signalled()
                        || self.round.completion.should_stop())
                {
                    break;
                }
                if !self.one_operation(&ctx, &mut next_intended).await {
                    fatal = true;
                    break;
                }
            }

            if wrap {
                self.close_transaction(&ctx).await;
            }
            if fatal {
                break;
            }
            if let Some(think_time) = self.round.config.think_time {
                sleep(think_time).await;
            }
        }

        self.stats
    }

    /// Runs one operation and records it. Returns false on a fatal workload
    /// error.
    async fn one_operation(
        &mut self,
        ctx: &StressorContext,
        next_intended: &mut Option<Instant>,
    ) -> bool {
        let intended = match (self.round.config.cycle_time, next_intended.as_mut()) {
            (Some(cycle_time), Some(at)) => {
                let intended = *at;
                // a backlog issues immediately; the schedule never slips
                *at += cycle_time;
                sleep_until(intended).await;
                intended
            }
            _ => Instant::now(),
        };
        let issued = Instant::now();

        match self.logic.invoke(ctx).await {
            Ok(invocation) => {
                let completed = Instant::now();
                if self.round.handle.is_recording() {
                    let duration = if self.round.config.report_latency_as_service_time {
                        completed - issued
                    } else {
                        completed - intended
                    };
                    self.stats.record(&OperationSample {
                        operation: invocation.operation,
                        duration,
                        ok: invocation.ok,
                    });
                }
                true
            }
            Err(err) => {
                tracing::error!(
                    thread = self.thread.global,
                    error = %err,
                    "workload logic signalled a fatal error; stopping stressor"
                );
                false
            }
        }
    }

    async fn close_transaction(&mut self, ctx: &StressorContext) {
        let result = if self.round.config.transactions.commit_transactions {
            self.transactional.commit(&ctx.resource).await
        } else {
            self.transactional.rollback(&ctx.resource).await
        };
        if let Err(err) = result {
            let verb = if self.round.config.transactions.commit_transactions {
                "commit"
            } else {
                "rollback"
            };
            self.log_transaction_error(verb, &err);
        }
    }

    fn log_transaction_error(&self, verb: &str, err: &BoxError) {
        if self.round.config.transactions.log_transaction_exceptions {
            tracing::error!(thread = self.thread.global, verb, error = %err, "transaction failure");
        } else {
            tracing::debug!(thread = self.thread.global, verb, error = %err, "transaction failure");
        }
    }
}
