//! The per-node test stage: validates configuration, builds the completion
//! policy and pacer, runs the stressor fleet for one round, and reports the
//! node's measurements back to the coordinator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};

use crate::{
    cluster::{self, ClusterView, NodeId},
    completion::Completion,
    config::{CompletionTarget, StageConfig},
    error::StageError,
    fleet::{FleetRegistry, FleetWait, StressorFleet},
    pacing::OperationPacer,
    stats::{self, Measurements},
    stressor::{RoundContext, StressorConfig, Transactional, Workload},
};


/// Node → coordinator report for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack<S> {
    pub node: NodeId,
    pub payload: AckPayload<S>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPayload<S> {
    /// One bundle per stressor thread, or one pre-merged bundle when the
    /// node merges thread stats before reporting.
    Stats(Vec<S>),
    /// Nothing to report: service not running on this node, no threads
    /// assigned, or the round was started detached.
    Empty,
    Error(String),
}

impl<S> Ack<S> {
    pub fn is_error(&self) -> bool {
        matches!(self.payload, AckPayload::Error(_))
    }
}

/// Per-node driver of one benchmark round.
pub struct TestStage<W, T, S> {
    config: StageConfig,
    cluster: ClusterView,
    workload: W,
    transactional: Arc<T>,
    prototype: S,
    registry: Arc<FleetRegistry<S>>,
    service_running: bool,
}

impl<W, T, S> TestStage<W, T, S>
where
    W: Workload,
    T: Transactional,
    S: Measurements,
{
    pub fn new(
        config: StageConfig,
        cluster: ClusterView,
        workload: W,
        transactional: Arc<T>,
        prototype: S,
    ) -> Self {
        Self {
            config,
            cluster,
            workload,
            transactional,
            prototype,
            registry: Arc::new(FleetRegistry::new()),
            service_running: true,
        }
    }

    /// Share a registry between stages so a later await stage can find a
    /// round this stage started detached.
    pub fn with_registry(mut self, registry: Arc<FleetRegistry<S>>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_service_running(mut self, running: bool) -> Self {
        self.service_running = running;
        self
    }

    pub fn registry(&self) -> &Arc<FleetRegistry<S>> {
        &self.registry
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Runs one round on this node and produces its ack. Never panics the
    /// node: every failure is folded into an error ack.
    pub async fn execute(&self) -> Ack<S> {
        let node = self.cluster.self_node();
        if !self.service_running {
            tracing::info!("not running test on this node as service is not running");
            return Ack {
                node,
                payload: AckPayload::Empty,
            };
        }
        match self.run_round().await {
            Ok(payload) => Ack { node, payload },
            Err(err) => {
                tracing::error!(error = %err, test = self.config.test_name, "test stage failed");
                Ack {
                    node,
                    payload: AckPayload::Error(err.to_string()),
                }
            }
        }
    }

    async fn run_round(&self) -> Result<AckPayload<S>, StageError> {
        // Validating
        self.config.validate()?;
        let node = self.cluster.self_node();
        let my_threads = cluster::threads_on(&self.config.threads, &self.cluster, node)?;
        if my_threads == 0 {
            tracing::info!("no threads assigned to this node; skipping");
            return Ok(AckPayload::Empty);
        }
        let first_global = cluster::first_thread_on(&self.config.threads, &self.cluster, node)?;

        // Preparing
        let started = Instant::now();
        tracing::info!(test = self.config.test_name, "starting test");
        let fleet = self.start_fleet(node, my_threads, first_global).await?;

        if !self.config.ramp_up.is_zero() {
            tracing::info!(
                ramp_up = %humantime::format_duration(self.config.ramp_up),
                "ramping up"
            );
            sleep(self.config.ramp_up).await;
        }
        // RoundRunning: operations completing from here on are recorded
        fleet.handle().begin_measuring();

        if self.config.run_background {
            tracing::info!(
                test = self.config.test_name,
                "round runs detached; a later stage must await or terminate it"
            );
            self.registry
                .register(self.config.test_name.clone(), fleet);
            return Ok(AckPayload::Empty);
        }

        let payload = self.drain_fleet(fleet).await?;
        tracing::info!(
            test = self.config.test_name,
            elapsed = %humantime::format_duration(truncate_to_millis(started.elapsed())),
            "finished test"
        );
        Ok(payload)
    }

    async fn start_fleet(
        &self,
        node: NodeId,
        my_threads: usize,
        first_global: usize,
    ) -> Result<StressorFleet<S>, StageError> {
        let handle = crate::fleet::RoundHandle::new();
        let completion = match self.config.target {
            CompletionTarget::Operations(total) => {
                let share = cluster::operations_on(total, &self.cluster, node)?;
                tracing::debug!(total, share, "count-bounded round");
                Completion::count(share, handle.clone())
            }
            CompletionTarget::Duration(duration) => {
                tracing::debug!(duration = ?duration, "duration-bounded round");
                Completion::time(duration, handle.clone())
            }
        };
        let pacer = OperationPacer::new(
            self.config.synchronous_requests,
            my_threads,
            handle.clone(),
        );
        let round = RoundContext {
            handle,
            completion: Arc::new(completion),
            pacer: Arc::new(pacer),
            config: Arc::new(StressorConfig::from_stage(&self.config)),
        };
        let fleet = StressorFleet::start(
            my_threads,
            first_global,
            &self.workload,
            &self.transactional,
            &self.prototype,
            round,
        )
        .await?;
        Ok(fleet)
    }

    /// Draining: wait for completion (forcing termination on timeout), join
    /// the stressors, and fold their bundles per merge policy.
    async fn drain_fleet(&self, fleet: StressorFleet<S>) -> Result<AckPayload<S>, StageError> {
        if fleet.await_finished(self.config.timeout).await == FleetWait::TimedOut {
            tracing::warn!(
                test = self.config.test_name,
                timeout = ?self.config.timeout,
                "round did not finish in time; terminating stressors"
            );
            fleet.terminate();
        }
        let bundles = fleet.drain().await?;
        let stats = if self.config.merge_thread_stats {
            stats::merge_all(bundles).into_iter().collect()
        } else {
            bundles
        };
        Ok(AckPayload::Stats(stats))
    }

    /// Consumes a previously detached round and produces the same ack an
    /// immediate run would have.
    pub async fn await_detached(&self, key: &str) -> Ack<S> {
        let node = self.cluster.self_node();
        let Some(fleet) = self.registry.take(key) else {
            return Ack {
                node,
                payload: AckPayload::Error(format!(
                    "no detached round registered under key '{key}'"
                )),
            };
        };
        match self.drain_fleet(fleet).await {
            Ok(payload) => Ack { node, payload },
            Err(err) => Ack {
                node,
                payload: AckPayload::Error(err.to_string()),
            },
        }
    }
}

fn truncate_to_millis(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(duration.as_millis() as u64)
}
