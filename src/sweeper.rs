//! Expiry sweeper: reclaims closed pin windows and purges old history.
//!
//! Remote failures are absorbed by the engine (records stay `expired` and are
//! retried next round), so the loop itself only ever logs.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::pin::PinEngine;

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub interval: Duration,
    /// How long `unpinned` rows are kept. Zero keeps them forever.
    pub unpinned_retention: chrono::Duration,
}

/// One round: sweep, then purge history older than the retention window.
/// Returns (reclaimed, purged).
pub async fn sweep_once(engine: &PinEngine, settings: &SweepSettings, now: DateTime<Utc>) -> (usize, u64) {
    let reclaimed = match engine.sweep_at(now).await {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(error = %e, "sweep failed");
            0
        }
    };

    if settings.unpinned_retention <= chrono::Duration::zero() {
        return (reclaimed, 0);
    }

    let store = engine.store().clone();
    let cutoff = now - settings.unpinned_retention;
    let purged = match tokio::task::spawn_blocking(move || store.purge_unpinned_before(&cutoff)).await {
        Ok(Ok(count)) => count,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "purge failed");
            0
        }
        Err(e) => {
            tracing::warn!(error = %e, "purge task panicked");
            0
        }
    };

    (reclaimed, purged)
}

pub async fn run_sweep_loop(engine: PinEngine, settings: SweepSettings) {
    tracing::info!(
        interval_secs = settings.interval.as_secs(),
        retention_hours = settings.unpinned_retention.num_hours(),
        "sweeper started"
    );

    loop {
        let (reclaimed, purged) = sweep_once(&engine, &settings, Utc::now()).await;
        if reclaimed > 0 || purged > 0 {
            tracing::info!(reclaimed, purged, "sweep complete");
        }
        tokio::time::sleep(settings.interval).await;
    }
}
