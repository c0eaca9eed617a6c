//! Periodic removal of expired jobs.

use std::time::Duration;

use rf_pipeline::Orchestrator;
use tokio_util::sync::CancellationToken;

/// Call [`Orchestrator::reap_expired`] every `interval` until `cancel` fires.
pub async fn run_reaper(orchestrator: Orchestrator, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.reap_expired(chrono::Utc::now()).await {
                    tracing::warn!("Ledger reap failed: {e}");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("Reaper stopped");
}
