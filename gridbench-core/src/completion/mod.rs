//! Round completion policies.
//!
//! Every stressor consults the node's completion policy before each
//! operation; whichever actor first satisfies the condition fires the
//! round's finish signal exactly once.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::fleet::RoundHandle;

/// Node-wide decision of when the current round must stop.
pub enum Completion {
    Count(CountCompletion),
    Time(TimeCompletion),
}

impl Completion {
    /// Count-bounded: this node stops after issuing its assigned share of
    /// the cluster-wide operation count.
    pub fn count(target: u64, handle: Arc<RoundHandle>) -> Self {
        Completion::Count(CountCompletion {
            target,
            issued: AtomicU64::new(0),
            handle,
        })
    }

    /// Duration-bounded: this node stops once the round clock reaches
    /// `duration`, independent of how many operations were issued.
    pub fn time(duration: Duration, handle: Arc<RoundHandle>) -> Self {
        Completion::Time(TimeCompletion { duration, handle })
    }

    /// Queried before each operation. Returning `false` grants the caller
    /// one operation; the first query past the target fires the finish
    /// signal.
    pub fn should_stop(&self) -> bool {
        match self {
            Completion::Count(count) => count.should_stop(),
            Completion::Time(time) => time.should_stop(),
        }
    }
}

pub struct CountCompletion {
    target: u64,
    /// Shared across the node's stressors so the aggregate target is met
    /// exactly once even with uneven per-thread throughput.
    issued: AtomicU64,
    handle: Arc<RoundHandle>,
}

impl CountCompletion {
    fn should_stop(&self) -> bool {
        let slot = self.issued.fetch_add(1, Ordering::Relaxed);
        if slot < self.target {
            return false;
        }
        if slot == self.target {
            tracing::debug!(target = self.target, "operation target reached");
            // in-flight operations still count, so recording stays open
            self.handle.finish_round(false);
        }
        true
    }
}

pub struct TimeCompletion {
    duration: Duration,
    handle: Arc<RoundHandle>,
}

impl TimeCompletion {
    fn should_stop(&self) -> bool {
        if self.handle.started_at().elapsed() < self.duration {
            return false;
        }
        tracing::debug!(duration = ?self.duration, "round duration elapsed");
        // late operations must not inflate the measured window
        self.handle.finish_round(true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::RoundPhase;
    use tokio::time;

    #[tokio::test(flavor = "current_thread")]
    async fn count_completion_grants_exactly_the_target() {
        let handle = RoundHandle::new();
        let completion = Arc::new(Completion::count(10, handle.clone()));

        let mut granted = 0u64;
        while !completion.should_stop() {
            granted += 1;
        }
        assert_eq!(granted, 10);
        assert!(handle.is_signalled());
        // further queries keep refusing
        assert!(completion.should_stop());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn count_completion_is_shared_across_tasks() {
        let handle = RoundHandle::new();
        let completion = Arc::new(Completion::count(100, handle.clone()));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let completion = completion.clone();
            workers.push(tokio::spawn(async move {
                let mut granted = 0u64;
                while !completion.should_stop() {
                    granted += 1;
                    tokio::task::yield_now().await;
                }
                granted
            }));
        }

        let mut total = 0u64;
        for worker in workers {
            total += worker.await.unwrap();
        }
        assert_eq!(total, 100);
        assert!(handle.is_signalled());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_target_stops_immediately() {
        let handle = RoundHandle::new();
        let completion = Completion::count(0, handle.clone());
        assert!(completion.should_stop());
        assert!(handle.is_signalled());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn time_completion_stops_after_duration() {
        time::pause();

        let handle = RoundHandle::new();
        handle.begin_measuring();
        let completion = Completion::time(Duration::from_secs(5), handle.clone());

        assert!(!completion.should_stop());
        assert!(!handle.is_signalled());

        time::advance(Duration::from_secs(5)).await;
        assert!(completion.should_stop());
        assert!(handle.is_signalled());
        // duration rounds stop recording when they finish
        assert_eq!(handle.phase(), RoundPhase::Finished);
        assert!(!handle.is_recording());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn time_completion_ignores_operation_count() {
        time::pause();

        let handle = RoundHandle::new();
        let completion = Completion::time(Duration::from_secs(1), handle.clone());

        for _ in 0..10_000 {
            assert!(!completion.should_stop());
        }
        time::advance(Duration::from_secs(1)).await;
        assert!(completion.should_stop());
    }
}
