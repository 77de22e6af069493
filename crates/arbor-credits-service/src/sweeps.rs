//! Background maintenance sweeps.
//!
//! Two jobs share one ticker: expiring generations whose worker never
//! reported back (refunding the consumed unit), and purging rate-limit
//! records past their retention window. Neither affects correctness on
//! the request path; the expiry sweep is what guarantees no credit is
//! silently lost to a dead worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::state::AppState;

/// Spawn the background sweep task.
///
/// Runs until the process exits; each tick is independent, so one failed
/// sweep only logs and waits for the next interval.
pub fn spawn(state: Arc<AppState>) {
    let interval = Duration::from_secs(state.config.sweep_interval_seconds);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            expire_stale_generations(&state).await;
            purge_rate_limit_records(&state);
        }
    });

    tracing::info!(
        interval_seconds = %interval.as_secs(),
        "Background sweeps started"
    );
}

/// Expire generations whose worker never reported a result.
async fn expire_stale_generations(state: &Arc<AppState>) {
    let timeout = chrono::Duration::seconds(
        i64::try_from(state.config.generation_timeout_seconds).unwrap_or(300),
    );
    let cutoff = Utc::now() - timeout;

    let stale = match state.store.list_stale_generations(cutoff) {
        Ok(stale) => stale,
        Err(e) => {
            tracing::error!(error = %e, "Stale generation scan failed");
            return;
        }
    };

    for generation_id in stale {
        match state.store.expire_generation(&generation_id).await {
            Ok(true) => {
                tracing::warn!(
                    generation_id = %generation_id,
                    "Generation expired after worker timeout"
                );
            }
            Ok(false) => {
                // A result or refund landed between the scan and the lock
                tracing::debug!(
                    generation_id = %generation_id,
                    "Generation resolved before expiry"
                );
            }
            Err(e) => {
                tracing::error!(
                    generation_id = %generation_id,
                    error = %e,
                    "Failed to expire generation"
                );
            }
        }
    }
}

/// Drop rate-limit records older than the retention window.
fn purge_rate_limit_records(state: &Arc<AppState>) {
    let retention = Duration::from_secs(state.config.rate_limit_retention_seconds);

    match state.store.purge_rate_limit_records(retention) {
        Ok(0) => {}
        Ok(purged) => {
            tracing::debug!(purged = %purged, "Rate-limit records purged");
        }
        Err(e) => {
            tracing::error!(error = %e, "Rate-limit purge failed");
        }
    }
}
