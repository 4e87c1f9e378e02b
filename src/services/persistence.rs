//! Persistence service — write-behind batching of pixel edits.
//!
//! DESIGN
//! ======
//! Accepted edits are handed to a bounded queue with `try_send`, so the edit
//! path never waits on Postgres. A single worker task owns the
//! [`PendingBatch`] and flushes it when the batch reaches `batch_size`, when
//! `flush_interval_ms` has passed since the last flush, on every ticker tick,
//! and on explicit [`PersistenceHandle::flush`] requests.
//!
//! The batch keeps one entry per coordinate (last write wins). A multi-row
//! upsert may not touch the same key twice, so the collapse is required for
//! correctness, not only for size.
//!
//! ERROR HANDLING
//! ==============
//! A failing flush is retried `retries` times with linear back-off, then the
//! batch is logged and dropped. The in-memory canvas stays authoritative for
//! connected clients; loss is bounded to one batch and only matters if the
//! process also dies before the next successful write of those coordinates.
//!
//! The command queue holds `queue_capacity` writes. When it is full, a new
//! write is dropped and counted in `dropped_total` instead of stalling the
//! edit path, which runs under the canvas lock. Size the queue for the
//! expected edit burst between flushes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::canvas::{Coord, StoredPixel};
use crate::config::PersistConfig;
use crate::db::pixels::{PixelRepository, RepoError, RepoStats};
use crate::protocol::PersistSummary;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PersistError {
    #[error("persistence worker is not running")]
    WorkerGone,
    #[error("flush failed; dropped {dropped} pixel writes")]
    FlushFailed { dropped: usize },
    #[error("flush did not finish within {0:?}")]
    Timeout(Duration),
}

// =============================================================================
// PENDING BATCH
// =============================================================================

/// Pixel writes awaiting a flush, in first-insertion order, one per coordinate.
#[derive(Debug, Default)]
pub struct PendingBatch {
    rows: Vec<StoredPixel>,
    index: HashMap<Coord, usize>,
}

impl PendingBatch {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { rows: Vec::with_capacity(capacity), index: HashMap::with_capacity(capacity) }
    }

    /// Add a write. A coordinate already in the batch is overwritten in place;
    /// returns `false` in that case.
    pub fn push(&mut self, pixel: StoredPixel) -> bool {
        let coord = pixel.coord();
        if let Some(&slot) = self.index.get(&coord) {
            self.rows[slot] = pixel;
            return false;
        }
        self.index.insert(coord, self.rows.len());
        self.rows.push(pixel);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drain the batch, leaving it empty.
    pub fn take(&mut self) -> Vec<StoredPixel> {
        self.index.clear();
        std::mem::take(&mut self.rows)
    }
}

// =============================================================================
// HANDLE
// =============================================================================

enum PersistCommand {
    Write(StoredPixel),
    Flush(oneshot::Sender<Result<usize, PersistError>>),
}

#[derive(Default)]
struct PersistCounters {
    batched: AtomicUsize,
    flushed: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable front of the persistence worker.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistCommand>,
    repo: Arc<dyn PixelRepository>,
    default_color: Arc<str>,
    counters: Arc<PersistCounters>,
}

/// Spawn the batching worker. The worker drains and exits once every handle
/// has been dropped.
pub fn spawn_persistence_worker(
    repo: Arc<dyn PixelRepository>,
    config: PersistConfig,
    default_color: &str,
) -> (PersistenceHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let counters = Arc::new(PersistCounters::default());

    info!(
        queue_capacity = config.queue_capacity,
        batch_size = config.batch_size,
        flush_interval_ms = config.flush_interval_ms,
        retries = config.retries,
        retry_base_ms = config.retry_base_ms,
        "pixel persistence worker configured"
    );

    let worker = Worker { repo: Arc::clone(&repo), config, counters: Arc::clone(&counters) };
    let task = tokio::spawn(worker.run(rx));

    let handle = PersistenceHandle { tx, repo, default_color: Arc::from(default_color), counters };
    (handle, task)
}

impl PersistenceHandle {
    /// Queue a write without waiting. Returns `false` (and counts a drop) when
    /// the queue is full or the worker is gone.
    pub fn enqueue(&self, pixel: StoredPixel) -> bool {
        let (x, y) = (pixel.x, pixel.y);
        match self.tx.try_send(PersistCommand::Write(pixel)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(x, y, "pixel persist queue full; dropping write");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(x, y, "pixel persist queue closed; dropping write");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Flush everything queued before this call. Returns rows written.
    ///
    /// # Errors
    ///
    /// [`PersistError::WorkerGone`] if the worker stopped, or
    /// [`PersistError::FlushFailed`] if the batch was dropped after retries.
    pub async fn flush(&self) -> Result<usize, PersistError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PersistCommand::Flush(reply_tx))
            .await
            .map_err(|_| PersistError::WorkerGone)?;
        reply_rx.await.map_err(|_| PersistError::WorkerGone)?
    }

    /// Every stored non-default pixel, after flushing pending writes.
    /// Best effort: storage failure is logged and yields what was retrievable.
    pub async fn load_all(&self) -> Vec<StoredPixel> {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "pre-load flush failed; loading current storage state");
        }
        match self.repo.load_pixels(&self.default_color).await {
            Ok(pixels) => {
                info!(count = pixels.len(), "loaded pixels from storage");
                pixels
            }
            Err(e) => {
                error!(error = %e, "failed to load pixels; starting from an empty canvas");
                Vec::new()
            }
        }
    }

    /// Delete stored default-colored rows last updated more than `age` before `now_ms`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn cleanup_stale(&self, age: Duration, now_ms: i64) -> Result<u64, RepoError> {
        let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(age_ms);
        let deleted = self.repo.delete_stale(&self.default_color, cutoff).await?;
        info!(deleted, cutoff, "stale pixel cleanup finished");
        Ok(deleted)
    }

    /// Shutdown flush bounded by `limit`.
    ///
    /// # Errors
    ///
    /// As [`Self::flush`], plus [`PersistError::Timeout`].
    pub async fn force_flush_all(&self, limit: Duration) -> Result<usize, PersistError> {
        let written = tokio::time::timeout(limit, self.flush())
            .await
            .map_err(|_| PersistError::Timeout(limit))??;
        info!(written, "final pixel flush complete");
        Ok(written)
    }

    /// Row counts from storage.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn repo_stats(&self) -> Result<RepoStats, RepoError> {
        self.repo.stats(&self.default_color).await
    }

    /// Writes queued or batched but not yet flushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        let queued = self.tx.max_capacity() - self.tx.capacity();
        queued + self.counters.batched.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn summary(&self) -> PersistSummary {
        PersistSummary {
            pending_writes: self.pending(),
            flushed_total: self.counters.flushed.load(Ordering::Relaxed),
            dropped_total: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

struct Worker {
    repo: Arc<dyn PixelRepository>,
    config: PersistConfig,
    counters: Arc<PersistCounters>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<PersistCommand>) {
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let mut batch = PendingBatch::with_capacity(self.config.batch_size);
        let mut last_flush = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(PersistCommand::Write(pixel)) => {
                        batch.push(pixel);
                        self.counters.batched.store(batch.len(), Ordering::Relaxed);
                        if batch.len() >= self.config.batch_size || last_flush.elapsed() >= interval {
                            let _ = self.flush_with_retry(&mut batch).await;
                            last_flush = Instant::now();
                        }
                    }
                    Some(PersistCommand::Flush(reply)) => {
                        let result = self.flush_with_retry(&mut batch).await;
                        last_flush = Instant::now();
                        let _ = reply.send(result);
                    }
                    None => {
                        let _ = self.flush_with_retry(&mut batch).await;
                        debug!("pixel persistence worker stopped");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        let _ = self.flush_with_retry(&mut batch).await;
                        last_flush = Instant::now();
                    }
                }
            }
        }
    }

    async fn flush_with_retry(&self, batch: &mut PendingBatch) -> Result<usize, PersistError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let drained = batch.take();
        self.counters.batched.store(0, Ordering::Relaxed);
        let retries = self.config.retries.max(1);
        for attempt in 1..=retries {
            match self.repo.upsert_pixels(&drained).await {
                Ok(()) => {
                    self.counters.flushed.fetch_add(drained.len() as u64, Ordering::Relaxed);
                    debug!(count = drained.len(), "pixel batch flushed");
                    return Ok(drained.len());
                }
                Err(e) if attempt < retries => {
                    warn!(error = %e, attempt, total = retries, count = drained.len(), "pixel batch persist failed; retrying");
                    tokio::time::sleep(retry_delay(attempt, self.config.retry_base_ms)).await;
                }
                Err(e) => {
                    error!(error = %e, count = drained.len(), "pixel batch persist failed after retries; dropping writes");
                }
            }
        }

        self.counters.dropped.fetch_add(drained.len() as u64, Ordering::Relaxed);
        Err(PersistError::FlushFailed { dropped: drained.len() })
    }
}

/// Linear back-off: `attempt * base_ms`, saturating.
fn retry_delay(attempt: usize, base_ms: u64) -> Duration {
    let attempt = u64::try_from(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(attempt.saturating_mul(base_ms))
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
