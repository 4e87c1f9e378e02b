//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! into each websocket session. It owns the process-wide singletons: the
//! canvas, the connection registry, the cooldown tracker and the persistence
//! handle. Nothing in the crate reaches for ambient globals.
//!
//! The canvas sits behind a std `Mutex`. Critical sections never await, so
//! an async lock would only add overhead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::canvas::CanvasStore;
use crate::config::AppConfig;
use crate::protocol::{CanvasInfo, CanvasSummary, ConnectionSummary, SessionStats};
use crate::rate_limit::RateLimiter;
use crate::services::broadcast::Broadcaster;
use crate::services::persistence::PersistenceHandle;

/// Shared application state. Clone is required by Axum; every field is shared.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub canvas: Arc<Mutex<CanvasStore>>,
    pub broadcaster: Broadcaster,
    pub rate_limiter: RateLimiter,
    pub persistence: PersistenceHandle,
    /// Cleared once shutdown begins; edits are refused afterwards.
    accepting: Arc<AtomicBool>,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, persistence: PersistenceHandle) -> Self {
        let canvas = CanvasStore::new(config.canvas.width, config.canvas.height, config.canvas.default_color.clone());
        let rate_limiter = RateLimiter::new(config.canvas.cooldown());
        Self {
            config: Arc::new(config),
            canvas: Arc::new(Mutex::new(canvas)),
            broadcaster: Broadcaster::new(),
            rate_limiter,
            persistence,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn lock_canvas(&self) -> MutexGuard<'_, CanvasStore> {
        self.canvas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuse further edits. Returns `false` if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        self.accepting.swap(false, Ordering::AcqRel)
    }

    /// Wait out any edit holding the canvas lock. Called after
    /// [`Self::begin_shutdown`]; on return every accepted edit is queued for
    /// persistence and no further edit can be accepted.
    pub fn drain_edits(&self) {
        drop(self.lock_canvas());
    }

    #[must_use]
    pub fn canvas_info(&self) -> CanvasInfo {
        let canvas = self.lock_canvas();
        CanvasInfo {
            width: canvas.width(),
            height: canvas.height(),
            cooldown_time: self.rate_limiter.cooldown().as_secs(),
        }
    }

    /// Snapshot for `get_stats` replies and the stats endpoint.
    #[must_use]
    pub fn session_stats(&self, your_id: Option<Uuid>) -> SessionStats {
        let canvas_stats = self.lock_canvas().stats();
        SessionStats {
            canvas: CanvasSummary::new(self.canvas_info(), canvas_stats, self.config.canvas.colors.len()),
            connections: ConnectionSummary { active: self.broadcaster.count(), your_id },
            persistence: self.persistence.summary(),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::collections::BTreeMap;

    use super::*;
    use crate::canvas::{Coord, StoredPixel};
    use crate::db::pixels::{PixelRepository, RepoError, RepoStats};
    use crate::services::persistence::spawn_persistence_worker;

    /// In-memory [`PixelRepository`] with a failure switch.
    #[derive(Default)]
    pub struct MemoryRepository {
        rows: Mutex<BTreeMap<Coord, StoredPixel>>,
        upserts: Mutex<Vec<Vec<StoredPixel>>>,
        failing: AtomicBool,
    }

    impl MemoryRepository {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn seed(&self, pixels: impl IntoIterator<Item = StoredPixel>) {
            let mut rows = self.rows.lock().unwrap();
            for pixel in pixels {
                rows.insert(pixel.coord(), pixel);
            }
        }

        /// Stored rows ordered by (x, y).
        pub fn rows(&self) -> Vec<StoredPixel> {
            self.rows.lock().unwrap().values().cloned().collect()
        }

        /// Every successful upsert call, in order.
        pub fn upsert_batches(&self) -> Vec<Vec<StoredPixel>> {
            self.upserts.lock().unwrap().clone()
        }

        fn check(&self) -> Result<(), RepoError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RepoError::Database(sqlx::Error::PoolTimedOut));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl PixelRepository for MemoryRepository {
        async fn upsert_pixels(&self, pixels: &[StoredPixel]) -> Result<(), RepoError> {
            self.check()?;
            let mut rows = self.rows.lock().unwrap();
            for pixel in pixels {
                rows.insert(pixel.coord(), pixel.clone());
            }
            self.upserts.lock().unwrap().push(pixels.to_vec());
            Ok(())
        }

        async fn load_pixels(&self, default_color: &str) -> Result<Vec<StoredPixel>, RepoError> {
            self.check()?;
            Ok(self.rows.lock().unwrap().values().filter(|p| p.color != default_color).cloned().collect())
        }

        async fn delete_stale(&self, default_color: &str, older_than: i64) -> Result<u64, RepoError> {
            self.check()?;
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|_, p| p.color != default_color || p.last_update >= older_than);
            Ok((before - rows.len()) as u64)
        }

        async fn stats(&self, default_color: &str) -> Result<RepoStats, RepoError> {
            self.check()?;
            let rows = self.rows.lock().unwrap();
            let active = rows.values().filter(|p| p.color != default_color).count();
            Ok(RepoStats { total_pixels: rows.len() as i64, active_pixels: active as i64 })
        }
    }

    /// Small canvas, 60 s cooldown, timer flushes effectively disabled so
    /// tests control flushing explicitly.
    #[must_use]
    pub fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.canvas.width = 10;
        config.canvas.height = 10;
        config.canvas.cooldown_time = 60;
        config.persistence.flush_interval_ms = 60_000;
        config
    }

    /// Test `AppState` backed by a fresh [`MemoryRepository`]. Needs a tokio runtime.
    #[must_use]
    pub fn test_app_state() -> (AppState, Arc<MemoryRepository>) {
        test_app_state_with(test_config())
    }

    #[must_use]
    pub fn test_app_state_with(config: AppConfig) -> (AppState, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::default());
        let (persistence, _task) =
            spawn_persistence_worker(repo.clone(), config.persistence.clone(), &config.canvas.default_color);
        (AppState::new(config, persistence), repo)
    }

    #[must_use]
    pub fn stored(x: i32, y: i32, color: &str, last_update: i64) -> StoredPixel {
        StoredPixel { x, y, color: color.into(), last_update }
    }
}
