use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::time;
use tracing_test::traced_test;

use super::*;
use crate::{
    completion::Completion,
    config::{CompletionTarget, StageConfig},
    error::BoxError,
    pacing::OperationPacer,
    stats::{BasicStats, Operation},
    stressor::{Invocation, OperationLogic, NonTransactional, StressorConfig, StressorContext},
};

/// Workload that sleeps a bit per operation and counts invocations.
struct TickingWorkload {
    delay: Duration,
    invocations: Arc<AtomicU64>,
    fail_init: bool,
}

struct TickingLogic {
    delay: Duration,
    invocations: Arc<AtomicU64>,
    fail_init: bool,
}

impl OperationLogic for TickingLogic {
    fn init(&mut self, _ctx: &StressorContext) -> Result<(), BoxError> {
        if self.fail_init {
            return Err("init refused".into());
        }
        Ok(())
    }

    async fn invoke(&mut self, _ctx: &StressorContext) -> Result<Invocation, BoxError> {
        tokio::time::sleep(self.delay).await;
        self.invocations.fetch_add(1, Ordering::Relaxed);
        Ok(Invocation {
            operation: Operation::from_static("tick"),
            ok: true,
        })
    }
}

impl Workload for TickingWorkload {
    type Logic = TickingLogic;

    fn logic(&self, _thread: ThreadId) -> TickingLogic {
        TickingLogic {
            delay: self.delay,
            invocations: self.invocations.clone(),
            fail_init: self.fail_init,
        }
    }
}

fn workload(delay_ms: u64) -> TickingWorkload {
    TickingWorkload {
        delay: Duration::from_millis(delay_ms),
        invocations: Arc::new(AtomicU64::new(0)),
        fail_init: false,
    }
}

fn round(handle: &Arc<RoundHandle>, completion: Completion, threads: usize) -> RoundContext {
    let config = StageConfig::new("fleet-test", CompletionTarget::Operations(0));
    RoundContext {
        handle: handle.clone(),
        completion: Arc::new(completion),
        pacer: Arc::new(OperationPacer::new(false, threads, handle.clone())),
        config: Arc::new(StressorConfig::from_stage(&config)),
    }
}

async fn start_fleet(
    count: usize,
    target: u64,
    delay_ms: u64,
) -> (StressorFleet<BasicStats>, Arc<AtomicU64>) {
    let workload = workload(delay_ms);
    let invocations = workload.invocations.clone();
    let handle = RoundHandle::new();
    let round = round(&handle, Completion::count(target, handle.clone()), count);
    let fleet = StressorFleet::start(
        count,
        0,
        &workload,
        &Arc::new(NonTransactional),
        &BasicStats::new(),
        round,
    )
    .await
    .unwrap();
    (fleet, invocations)
}

#[tokio::test(flavor = "current_thread")]
async fn finish_signal_is_single_fire() {
    let handle = RoundHandle::new();
    assert!(!handle.is_signalled());

    handle.finish_round(false);
    assert!(handle.is_signalled());
    let phase = handle.phase();

    // a second trigger is a no-op, not an error
    handle.finish_round(false);
    handle.finish_round(true);
    assert!(handle.is_signalled());
    assert_eq!(handle.phase(), phase);

    // resolves immediately after the fact, any number of times
    handle.finished().await;
    handle.finished().await;
}

#[tokio::test(flavor = "current_thread")]
async fn duration_finish_stops_recording_but_termination_wins() {
    let handle = RoundHandle::new();
    handle.begin_measuring();
    assert!(handle.is_recording());

    handle.terminate();
    assert_eq!(handle.phase(), RoundPhase::Terminated);

    // a late duration-expiry must not overwrite the terminated phase
    handle.finish_round(true);
    assert_eq!(handle.phase(), RoundPhase::Terminated);
}

#[tokio::test(flavor = "current_thread")]
async fn zero_thread_fleet_finishes_immediately() {
    time::pause();

    let (fleet, _) = start_fleet(0, 100, 1).await;
    assert_eq!(fleet.thread_count(), 0);
    assert_eq!(
        fleet.await_finished(Some(Duration::from_secs(1))).await,
        FleetWait::Finished
    );
    assert!(fleet.drain().await.unwrap().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn fleet_runs_to_count_completion() {
    time::pause();

    let (fleet, invocations) = start_fleet(3, 30, 1).await;
    assert_eq!(fleet.thread_count(), 3);

    assert_eq!(fleet.await_finished(None).await, FleetWait::Finished);
    let bundles = fleet.drain().await.unwrap();
    assert_eq!(bundles.len(), 3);
    assert_eq!(invocations.load(Ordering::Relaxed), 30);
}

#[tokio::test(flavor = "current_thread")]
async fn await_finished_times_out_and_termination_unblocks_the_fleet() {
    time::pause();

    // target far beyond what the round will reach
    let (fleet, invocations) = start_fleet(2, u64::MAX, 10).await;

    assert_eq!(
        fleet.await_finished(Some(Duration::from_secs(1))).await,
        FleetWait::TimedOut
    );
    fleet.terminate();
    assert!(fleet.handle().was_forced());

    let bundles = fleet.drain().await.unwrap();
    assert_eq!(bundles.len(), 2);
    assert!(invocations.load(Ordering::Relaxed) > 0);
}

#[tokio::test(flavor = "current_thread")]
async fn init_failure_surfaces_as_startup_error() {
    let mut workload = workload(1);
    workload.fail_init = true;
    let handle = RoundHandle::new();
    let round = round(&handle, Completion::count(10, handle.clone()), 2);

    let result = StressorFleet::<BasicStats>::start(
        2,
        0,
        &workload,
        &Arc::new(NonTransactional),
        &BasicStats::new(),
        round,
    )
    .await;

    let err = result.err().unwrap();
    assert!(err.to_string().contains("failed to initialize"));
}

#[traced_test]
#[tokio::test(flavor = "current_thread")]
async fn registering_over_a_live_key_terminates_the_stale_fleet() {
    time::pause();

    let registry = FleetRegistry::new();
    let (first, _) = start_fleet(1, u64::MAX, 5).await;
    let first_handle = first.handle().clone();
    registry.register("bg-round".into(), first);

    let (second, _) = start_fleet(1, u64::MAX, 5).await;
    registry.register("bg-round".into(), second);

    assert!(first_handle.was_forced());
    assert!(logs_contain("replacing a still-registered fleet"));
    assert!(registry.terminate("bg-round"));
}

#[tokio::test(flavor = "current_thread")]
async fn registry_takes_and_terminates_by_key() {
    time::pause();

    let registry = FleetRegistry::new();
    let (fleet, _) = start_fleet(1, u64::MAX, 5).await;
    registry.register("bg-round".into(), fleet);

    assert!(!registry.terminate("missing"));
    assert!(registry.terminate("bg-round"));

    // termination leaves the fleet registered for a later await
    let fleet = registry.take("bg-round").unwrap();
    assert_eq!(
        fleet.await_finished(Some(Duration::from_secs(1))).await,
        FleetWait::Finished
    );
    assert!(registry.take("bg-round").is_none());
}
