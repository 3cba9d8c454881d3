//! Exponential backoff schedules and the accept-loop crash supervisor
//!
//! Transient accept-loop errors are retried with doubling delays; a loop task
//! that itself dies (panic or unexpected return) is restarted by a
//! supervisor with its own schedule, at most [`MAX_LOOP_CRASHES`] times in a
//! row before giving up.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{error, warn};

/// Consecutive crashes tolerated before a supervisor gives up.
pub const MAX_LOOP_CRASHES: u32 = 5;

/// A run lasting at least this long counts as healthy and resets the
/// supervisor's crash budget.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Doubling delay schedule: `min(base * 2^(attempt-1), cap)` plus optional
/// uniform jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl BackoffSchedule {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: Duration::ZERO,
        }
    }

    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.cap);
        if self.jitter.is_zero() {
            scaled
        } else {
            let extra = rand::thread_rng().gen_range(0..self.jitter.as_millis().max(1) as u64);
            scaled + Duration::from_millis(extra)
        }
    }
}

/// How a supervised loop iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The loop observed shutdown and returned; supervision ends.
    Clean,
    /// The loop hit an unrecoverable internal error; restart with backoff.
    Crashed,
}

/// Final verdict of a supervision session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperviseOutcome {
    Clean,
    GaveUp,
}

/// Run `make_run` repeatedly until it exits clean or the crash budget is
/// spent. Each iteration runs as its own task so panics are contained and
/// counted as crashes.
pub async fn supervise<F, Fut>(
    name: &'static str,
    schedule: BackoffSchedule,
    max_crashes: u32,
    mut make_run: F,
) -> SuperviseOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LoopExit> + Send + 'static,
{
    let mut crashes: u32 = 0;
    loop {
        let started = Instant::now();
        let exit = match tokio::spawn(make_run()).await {
            Ok(exit) => exit,
            Err(join_err) if join_err.is_panic() => {
                error!(loop_name = name, "loop task panicked");
                LoopExit::Crashed
            }
            // Cancelled from outside; nothing left to supervise.
            Err(_) => return SuperviseOutcome::Clean,
        };

        match exit {
            LoopExit::Clean => return SuperviseOutcome::Clean,
            LoopExit::Crashed => {
                if started.elapsed() >= HEALTHY_RUN {
                    crashes = 0;
                }
                crashes += 1;
                if crashes > max_crashes {
                    error!(loop_name = name, crashes, "crash budget spent, giving up");
                    return SuperviseOutcome::GaveUp;
                }
                let delay = schedule.delay(crashes);
                warn!(
                    loop_name = name,
                    crashes,
                    delay_ms = delay.as_millis() as u64,
                    "loop crashed, restarting after backoff"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn schedule_doubles_and_caps() {
        let schedule =
            BackoffSchedule::new(Duration::from_millis(500), Duration::from_secs(15));
        assert_eq!(schedule.delay(1), Duration::from_millis(500));
        assert_eq!(schedule.delay(2), Duration::from_millis(1000));
        assert_eq!(schedule.delay(3), Duration::from_millis(2000));
        assert_eq!(schedule.delay(6), Duration::from_secs(15));
        assert_eq!(schedule.delay(40), Duration::from_secs(15));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let schedule = BackoffSchedule::new(Duration::from_millis(500), Duration::from_secs(30))
            .with_jitter(Duration::from_millis(100));
        for attempt in 1..8 {
            let base = BackoffSchedule::new(Duration::from_millis(500), Duration::from_secs(30))
                .delay(attempt);
            let jittered = schedule.delay(attempt);
            assert!(jittered >= base);
            assert!(jittered < base + Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn supervisor_restarts_until_clean() {
        tokio::time::pause();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();

        let outcome = supervise(
            "test-loop",
            BackoffSchedule::new(Duration::from_millis(1), Duration::from_millis(4)),
            MAX_LOOP_CRASHES,
            move || {
                let r = r.clone();
                async move {
                    if r.fetch_add(1, Ordering::Relaxed) < 2 {
                        LoopExit::Crashed
                    } else {
                        LoopExit::Clean
                    }
                }
            },
        )
        .await;

        assert_eq!(outcome, SuperviseOutcome::Clean);
        assert_eq!(runs.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn supervisor_gives_up_after_budget() {
        tokio::time::pause();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();

        let outcome = supervise(
            "test-loop",
            BackoffSchedule::new(Duration::from_millis(1), Duration::from_millis(2)),
            2,
            move || {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::Relaxed);
                    LoopExit::Crashed
                }
            },
        )
        .await;

        assert_eq!(outcome, SuperviseOutcome::GaveUp);
        // Initial run plus two restarts.
        assert_eq!(runs.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn supervisor_counts_panics_as_crashes() {
        tokio::time::pause();
        let outcome = supervise(
            "test-loop",
            BackoffSchedule::new(Duration::from_millis(1), Duration::from_millis(2)),
            1,
            || async { panic!("boom") },
        )
        .await;
        assert_eq!(outcome, SuperviseOutcome::GaveUp);
    }
}
