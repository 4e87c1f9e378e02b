//! Durable pixel storage.
//!
//! DESIGN
//! ======
//! [`PixelRepository`] is the seam between the write-behind batcher and the
//! database. Production uses [`PgPixelRepository`]; tests swap in an
//! in-memory implementation.
//!
//! Upserts are multi-row `INSERT ... ON CONFLICT (x, y) DO UPDATE` statements
//! inside one transaction. Postgres refuses to update the same key twice in
//! one statement, so callers must hand in a batch with unique coordinates.

use sqlx::{PgPool, QueryBuilder};

use crate::canvas::StoredPixel;

/// Postgres caps bind parameters at 65535 per statement; 4 binds per row.
const UPSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Row counts reported by the stats surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RepoStats {
    pub total_pixels: i64,
    pub active_pixels: i64,
}

#[async_trait::async_trait]
pub trait PixelRepository: Send + Sync {
    /// Insert-or-update every pixel, keyed by coordinate. Coordinates must be unique.
    async fn upsert_pixels(&self, pixels: &[StoredPixel]) -> Result<(), RepoError>;

    /// All stored pixels whose color is not `default_color`.
    async fn load_pixels(&self, default_color: &str) -> Result<Vec<StoredPixel>, RepoError>;

    /// Delete `default_color` rows last updated before `older_than` (ms since epoch).
    async fn delete_stale(&self, default_color: &str, older_than: i64) -> Result<u64, RepoError>;

    async fn stats(&self, default_color: &str) -> Result<RepoStats, RepoError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgPixelRepository {
    pool: PgPool,
}

impl PgPixelRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PixelRepository for PgPixelRepository {
    async fn upsert_pixels(&self, pixels: &[StoredPixel]) -> Result<(), RepoError> {
        if pixels.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in pixels.chunks(UPSERT_CHUNK_ROWS) {
            let mut builder = QueryBuilder::new("INSERT INTO pixels (x, y, color, last_update) ");
            builder.push_values(chunk, |mut row, pixel| {
                row.push_bind(pixel.x)
                    .push_bind(pixel.y)
                    .push_bind(&pixel.color)
                    .push_bind(pixel.last_update);
            });
            builder.push(
                " ON CONFLICT (x, y) DO UPDATE SET color = EXCLUDED.color, last_update = EXCLUDED.last_update",
            );
            builder.build().execute(tx.as_mut()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_pixels(&self, default_color: &str) -> Result<Vec<StoredPixel>, RepoError> {
        let rows = sqlx::query_as::<_, (i32, i32, String, i64)>(
            "SELECT x, y, color, last_update FROM pixels WHERE color <> $1",
        )
        .bind(default_color)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(x, y, color, last_update)| StoredPixel { x, y, color, last_update })
            .collect())
    }

    async fn delete_stale(&self, default_color: &str, older_than: i64) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM pixels WHERE color = $1 AND last_update < $2")
            .bind(default_color)
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, default_color: &str) -> Result<RepoStats, RepoError> {
        let (total_pixels, active_pixels) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE color <> $1) FROM pixels",
        )
        .bind(default_color)
        .fetch_one(&self.pool)
        .await?;
        Ok(RepoStats { total_pixels, active_pixels })
    }
}

#[cfg(all(test, feature = "live-db-tests"))]
#[path = "pixels_test.rs"]
mod tests;
