use std::future::Future;

use anyhow::Result;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::poller::PollStats;

/// Runs the poller on its own task and cancels `token` however it ends
///
/// Returns the poller's totals when it shut down cleanly. A poller that
/// failed or panicked has lost its totals; the cause is logged instead.
pub async fn supervise<F>(poller: F, token: CancellationToken) -> Option<PollStats>
where
    F: Future<Output = Result<PollStats>> + Send + 'static,
{
    let outcome = tokio::spawn(poller).await;
    // The shutdown listener and the final read-out wait on this
    token.cancel();

    match outcome {
        Ok(Ok(stats)) => {
            info!(
                "poller stopped after {} polls: {} records, {} cores overflowed",
                stats.polls, stats.records, stats.overflows
            );
            Some(stats)
        }
        Ok(Err(e)) => {
            error!("poller failed: {:#}", e);
            None
        }
        Err(join_error) => {
            error!("poller panicked: {}", join_error);
            None
        }
    }
}
