//! Periodic visits to the sampling sessions.
//!
//! The poller never owns the sessions. It shares them behind a mutex and
//! holds the lock for one whole visit, so a concurrent stop waits for the
//! current visit to finish. Cancellation is checked between visits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counts gathered by one or more visits
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub polls: u64,
    /// Records read out of the buffers
    pub records: u64,
    /// Cores newly seen past their buffer's interrupt threshold
    pub overflows: u64,
}

impl PollStats {
    /// Stats of a single visit
    pub fn visit(records: u64, overflows: u64) -> Self {
        Self {
            polls: 1,
            records,
            overflows,
        }
    }

    pub fn add(&mut self, other: &PollStats) {
        self.polls += other.polls;
        self.records += other.records;
        self.overflows += other.overflows;
    }
}

/// Calls `visit` on `target` every `period` until `token` is cancelled
///
/// The first visit happens immediately. A failed visit ends the poller with
/// that error.
pub async fn run_poller<M, F>(
    target: Arc<Mutex<M>>,
    period: Duration,
    token: CancellationToken,
    mut visit: F,
) -> Result<PollStats>
where
    F: FnMut(&mut M) -> Result<PollStats>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut total = PollStats::default();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let stats = visit_locked(&target, &mut visit)?;
                total.add(&stats);
            }
        }
    }

    Ok(total)
}

fn visit_locked<M, F>(target: &Mutex<M>, visit: &mut F) -> Result<PollStats>
where
    F: FnMut(&mut M) -> Result<PollStats>,
{
    let mut guard = target
        .lock()
        .map_err(|_| anyhow!("session state poisoned by an earlier panic"))?;
    visit(&mut guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_polls_until_cancelled() {
        let target = Arc::new(Mutex::new(0u64));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            canceller.cancel();
        });

        let stats = run_poller(target.clone(), Duration::from_millis(10), token, |n| {
            *n += 1;
            Ok(PollStats::visit(2, 0))
        })
        .await
        .unwrap();

        let visits = *target.lock().unwrap();
        assert!(visits >= 2);
        assert_eq!(stats.polls, visits);
        assert_eq!(stats.records, 2 * visits);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();

        let target = Arc::new(Mutex::new(()));
        let stats = run_poller(target, Duration::from_secs(1), token, |_| {
            Ok(PollStats::visit(1, 0))
        })
        .await
        .unwrap();
        // Either branch may win the first select, but never more than once
        assert!(stats.polls <= 1);
    }

    #[tokio::test]
    async fn test_visit_error_ends_poller() {
        let target = Arc::new(Mutex::new(0u32));
        let result = run_poller(
            target.clone(),
            Duration::from_millis(1),
            CancellationToken::new(),
            |n| {
                *n += 1;
                if *n == 3 {
                    Err(anyhow!("disk full"))
                } else {
                    Ok(PollStats::default())
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().to_string(), "disk full");
        assert_eq!(*target.lock().unwrap(), 3);
    }

    #[test]
    fn test_stats_add() {
        let mut total = PollStats::default();
        total.add(&PollStats::visit(10, 1));
        total.add(&PollStats::visit(5, 0));
        assert_eq!(
            total,
            PollStats {
                polls: 2,
                records: 15,
                overflows: 1
            }
        );
    }
}
