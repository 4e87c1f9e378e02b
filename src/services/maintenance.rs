//! Maintenance service — periodic flush, statistics and storage cleanup.
//!
//! One background task multiplexes three independent timers. A failing step
//! is logged and the loop keeps going; nothing here is fatal.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::protocol::now_ms;
use crate::state::AppState;

/// Spawn the maintenance loop. Abort the handle to stop it.
pub fn spawn_maintenance_task(state: AppState) -> JoinHandle<()> {
    let config = state.config.maintenance.clone();
    info!(
        flush_secs = config.flush_interval_secs,
        stats_secs = config.stats_interval_secs,
        cleanup_secs = config.cleanup_interval_secs,
        cleanup_age_days = config.cleanup_age_days,
        "maintenance task configured"
    );

    tokio::spawn(async move {
        let mut flush = ticker(config.flush_interval_secs).await;
        let mut stats = ticker(config.stats_interval_secs).await;
        let mut cleanup = ticker(config.cleanup_interval_secs).await;

        loop {
            tokio::select! {
                _ = flush.tick() => {
                    run_flush(&state).await;
                }
                _ = stats.tick() => {
                    log_stats(&state).await;
                }
                _ = cleanup.tick() => {
                    run_cleanup(&state, now_ms()).await;
                }
            }
        }
    })
}

/// Interval whose immediate first tick has already been consumed.
async fn ticker(secs: u64) -> Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    interval
}

pub(crate) async fn run_flush(state: &AppState) -> usize {
    match state.persistence.flush().await {
        Ok(written) => written,
        Err(e) => {
            warn!(error = %e, "maintenance flush failed");
            0
        }
    }
}

pub(crate) async fn log_stats(state: &AppState) {
    let stats = state.lock_canvas().stats();
    let online = state.broadcaster.count();
    let cooldown_tracked = state.rate_limiter.tracked();
    let persistence = state.persistence.summary();

    match state.persistence.repo_stats().await {
        Ok(db) => info!(
            active_pixels = stats.active_count,
            memory_efficiency = stats.memory_efficiency,
            cache_hits = stats.cache_hits,
            cache_misses = stats.cache_misses,
            online,
            cooldown_tracked,
            pending_writes = persistence.pending_writes,
            db_total = db.total_pixels,
            db_active = db.active_pixels,
            "canvas stats"
        ),
        Err(e) => {
            warn!(error = %e, "failed to read storage stats");
            info!(
                active_pixels = stats.active_count,
                memory_efficiency = stats.memory_efficiency,
                online,
                cooldown_tracked,
                pending_writes = persistence.pending_writes,
                "canvas stats"
            );
        }
    }
}

pub(crate) async fn run_cleanup(state: &AppState, now: i64) -> u64 {
    match state.persistence.cleanup_stale(state.config.maintenance.cleanup_age(), now).await {
        Ok(deleted) => deleted,
        Err(e) => {
            error!(error = %e, "stale pixel cleanup failed");
            0
        }
    }
}

#[cfg(test)]
#[path = "maintenance_test.rs"]
mod tests;
