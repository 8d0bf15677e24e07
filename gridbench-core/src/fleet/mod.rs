//! Round state, the single-fire finish signal, and the fleet of stressors a
//! node runs for one round.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    error::StartupError,
    stats::Measurements,
    stressor::{RoundContext, Stressor, ThreadId, Transactional, Workload},
};

#[cfg(test)]
mod tests;

/// Where the round currently is, observed by stressors with an atomic load.
///
/// `Warmup` covers ramp-up: stressors issue operations but do not record
/// them. `Finished` stops recording for duration-bounded rounds while
/// letting in-flight operations complete. `Terminated` is the forced exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoundPhase {
    Warmup = 0,
    Measuring = 1,
    Finished = 2,
    Terminated = 3,
}

impl RoundPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RoundPhase::Warmup,
            1 => RoundPhase::Measuring,
            2 => RoundPhase::Finished,
            _ => RoundPhase::Terminated,
        }
    }
}

/// Shared state of one round: the phase, the round clock, and the
/// single-fire finish signal visible to every stressor and to the
/// orchestrator's waiter.
#[derive(Debug)]
pub struct RoundHandle {
    phase: AtomicU8,
    fired: AtomicBool,
    finish: watch::Sender<bool>,
    started_at: Instant,
    forced: AtomicBool,
}

impl RoundHandle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            phase: AtomicU8::new(RoundPhase::Warmup as u8),
            fired: AtomicBool::new(false),
            finish: watch::Sender::new(false),
            started_at: Instant::now(),
            forced: AtomicBool::new(false),
        })
    }

    pub fn phase(&self) -> RoundPhase {
        RoundPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Operations completing now are recorded.
    pub fn is_recording(&self) -> bool {
        self.phase() == RoundPhase::Measuring
    }

    /// The finish signal has fired; stressors must not issue new operations.
    pub fn is_signalled(&self) -> bool {
        *self.finish.borrow()
    }

    /// When the round was prepared; duration-bounded completion measures
    /// from here.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The round ended through forced termination (timeout or an explicit
    /// terminate) rather than by satisfying its completion policy.
    pub fn was_forced(&self) -> bool {
        self.forced.load(Ordering::Relaxed)
    }

    /// Resolves once the finish signal fires. Safe to call any number of
    /// times, before or after the fact.
    pub async fn finished(&self) {
        let mut rx = self.finish.subscribe();
        // the sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Ramp-up is over; start counting operations.
    pub(crate) fn begin_measuring(&self) {
        let _ = self.phase.compare_exchange(
            RoundPhase::Warmup as u8,
            RoundPhase::Measuring as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Round completion reached. `stop_recording` is set by duration-bounded
    /// completion so late operations do not inflate the measured window;
    /// count-bounded completion keeps recording for in-flight operations.
    pub(crate) fn finish_round(&self, stop_recording: bool) {
        if stop_recording {
            for from in [RoundPhase::Warmup, RoundPhase::Measuring] {
                if self
                    .phase
                    .compare_exchange(
                        from as u8,
                        RoundPhase::Finished as u8,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
            }
        }
        self.fire();
    }

    /// Forced exit: releases the same signal used for normal completion.
    pub(crate) fn terminate(&self) {
        self.phase
            .store(RoundPhase::Terminated as u8, Ordering::Release);
        self.forced.store(true, Ordering::Relaxed);
        self.fire();
    }

    /// Single-fire: a second trigger is a no-op, not an error.
    fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.finish.send_replace(true);
    }
}

/// Outcome of waiting for round completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FleetWait {
    Finished,
    TimedOut,
}

/// The set of stressors started on this node for one round.
pub struct StressorFleet<S> {
    stressors: Vec<JoinHandle<S>>,
    handle: Arc<RoundHandle>,
}

impl<S: Measurements> StressorFleet<S> {
    /// Spawns `count` stressors and returns once every one of them has
    /// signalled ready (initialized and about to enter its loop). A stressor
    /// failing before ready terminates the fleet and surfaces the failure.
    pub(crate) async fn start<W, T>(
        count: usize,
        first_global: usize,
        workload: &W,
        transactional: &Arc<T>,
        prototype: &S,
        round: RoundContext,
    ) -> Result<Self, StartupError>
    where
        W: Workload,
        T: Transactional,
    {
        let handle = round.handle.clone();
        if count == 0 {
            // nothing will ever satisfy the completion policy on this node
            tracing::info!("no stressor threads assigned; round finishes immediately");
            handle.finish_round(false);
            return Ok(Self {
                stressors: Vec::new(),
                handle,
            });
        }

        let (ready_tx, mut ready_rx) = mpsc::channel(count);
        let mut stressors = Vec::with_capacity(count);
        for local in 0..count {
            let thread = ThreadId {
                global: first_global + local,
                local,
            };
            let stressor = Stressor::new(
                thread,
                workload.logic(thread),
                transactional.clone(),
                prototype.clone(),
                round.clone(),
            );
            stressors.push(tokio::spawn(stressor.run(ready_tx.clone())));
        }
        drop(ready_tx);

        let fleet = Self { stressors, handle };
        for _ in 0..count {
            match ready_rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    fleet.abort_startup().await;
                    return Err(StartupError::new("stressor failed to initialize", err));
                }
                None => {
                    fleet.abort_startup().await;
                    return Err(StartupError::message(
                        "stressor exited before signalling ready",
                    ));
                }
            }
        }
        tracing::info!(count, first_global, "started stressor threads");
        Ok(fleet)
    }

    async fn abort_startup(&self) {
        self.handle.terminate();
        for stressor in &self.stressors {
            stressor.abort();
        }
    }

    pub fn handle(&self) -> &Arc<RoundHandle> {
        &self.handle
    }

    pub fn thread_count(&self) -> usize {
        self.stressors.len()
    }

    /// Blocks until the finish signal fires or `timeout` elapses. On
    /// `TimedOut` the caller must force-terminate the fleet, or the
    /// stressors keep running.
    pub async fn await_finished(&self, timeout: Option<Duration>) -> FleetWait {
        match timeout {
            Some(ceiling) => {
                match tokio::time::timeout(ceiling, self.handle.finished()).await {
                    Ok(()) => FleetWait::Finished,
                    Err(_) => FleetWait::TimedOut,
                }
            }
            None => {
                self.handle.finished().await;
                FleetWait::Finished
            }
        }
    }

    /// Fires the finish signal (idempotent) and marks the round terminated.
    pub fn terminate(&self) {
        self.handle.terminate();
    }

    /// Joins every stressor and takes its measurement bundle.
    pub(crate) async fn drain(self) -> Result<Vec<S>, StartupError> {
        let mut bundles = Vec::with_capacity(self.stressors.len());
        for stressor in self.stressors {
            match stressor.await {
                Ok(stats) => bundles.push(stats),
                Err(err) => {
                    tracing::error!(error = %err, "stressor task failed");
                    return Err(StartupError::new("stressor task failed", err));
                }
            }
        }
        Ok(bundles)
    }
}

/// Node-local registry of detached (background) rounds, keyed by test name.
///
/// A later stage locates a still-running fleet here and either awaits it or
/// force-terminates it.
pub struct FleetRegistry<S> {
    fleets: Mutex<HashMap<String, StressorFleet<S>>>,
}

impl<S: Measurements> FleetRegistry<S> {
    pub fn new() -> Self {
        Self {
            fleets: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, key: String, fleet: StressorFleet<S>) {
        if let Some(stale) = self.fleets.lock().insert(key.clone(), fleet) {
            tracing::warn!(key, "replacing a still-registered fleet; terminating the old one");
            stale.handle.terminate();
        }
    }

    pub fn take(&self, key: &str) -> Option<StressorFleet<S>> {
        self.fleets.lock().remove(key)
    }

    /// Force-terminates a registered fleet, leaving it registered so a later
    /// await stage can still drain its partial measurements.
    pub fn terminate(&self, key: &str) -> bool {
        match self.fleets.lock().get(key) {
            Some(fleet) => {
                fleet.terminate();
                true
            }
            None => false,
        }
    }
}

impl<S: Measurements> Default for FleetRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
