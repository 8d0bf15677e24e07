//! Operation pacing.
//!
//! The pacer decides whether a thread may proceed to its next operation.
//! The base variant never waits; the synchronizing variant forces all local
//! threads to complete round *i* before any starts round *i+1*. Think-time
//! and cycle-time delays are applied inside the stressor loop and compose
//! with the pacer.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::fleet::RoundHandle;

/// What the pacer told the calling thread to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Pace {
    Proceed,
    /// Round termination was observed while parked; stop issuing operations.
    Stop,
}

pub enum OperationPacer {
    Passthrough,
    Synchronous(SynchronousPacer),
}

impl OperationPacer {
    pub fn new(synchronous: bool, local_threads: usize, handle: Arc<RoundHandle>) -> Self {
        if synchronous {
            OperationPacer::Synchronous(SynchronousPacer {
                barrier: RoundBarrier::new(local_threads.max(1)),
                handle,
            })
        } else {
            OperationPacer::Passthrough
        }
    }

    pub async fn next(&self, _local_thread: usize) -> Pace {
        match self {
            OperationPacer::Passthrough => Pace::Proceed,
            OperationPacer::Synchronous(sync) => sync.next().await,
        }
    }
}

/// Lock-step pacing: trades throughput for eliminating skew between the
/// node's local threads.
pub struct SynchronousPacer {
    barrier: RoundBarrier,
    handle: Arc<RoundHandle>,
}

impl SynchronousPacer {
    async fn next(&self) -> Pace {
        // A thread parked at the barrier must still observe termination:
        // once the finish signal fires, nobody else may arrive.
        tokio::select! {
            _ = self.handle.finished() => Pace::Stop,
            _ = self.barrier.wait() => Pace::Proceed,
        }
    }
}

/// Reusable barrier over a fixed number of parties, releasing a generation
/// at a time. Waiters observe generations through a watch channel, so a
/// cancelled wait does not wedge later generations' wakeups.
struct RoundBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    generation: watch::Sender<u64>,
}

struct BarrierState {
    generation: u64,
    arrived: usize,
}

impl RoundBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                generation: 0,
                arrived: 0,
            }),
            generation: watch::Sender::new(0),
        }
    }

    async fn wait(&self) {
        let waited_for = {
            let mut state = self.state.lock();
            state.arrived += 1;
            if state.arrived == self.parties {
                state.arrived = 0;
                state.generation += 1;
                self.generation.send_replace(state.generation);
                return;
            }
            state.generation + 1
        };

        let mut rx = self.generation.subscribe();
        // the sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|generation| *generation >= waited_for).await;
    }
}
