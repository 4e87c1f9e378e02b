//! Sparse canvas store.
//!
//! DESIGN
//! ======
//! Only non-default pixels are stored, so memory is proportional to the
//! number of painted coordinates rather than `width × height`. Any coordinate
//! absent from the map is implicitly the default color with `last_update = 0`.
//!
//! The active-pixel list sent to every new client is materialized lazily:
//! mutations mark the cache dirty, the next read rebuilds it once, and every
//! read after that shares the same `Arc` until the next mutation.
//!
//! The store is synchronous and owns no locks; `AppState` wraps it in a
//! mutex so callers decide how long a mutation stays exclusive.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// =============================================================================
// TYPES
// =============================================================================

/// In-bounds canvas coordinate. Only constructed through [`CanvasStore::coord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

/// Color and last-update time of one coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pixel {
    pub color: String,
    /// Milliseconds since Unix epoch. `0` for never-painted pixels.
    pub last_update: i64,
}

/// Entry of the active-pixel snapshot. Mirrors the `init.pixels` wire items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePixel {
    pub x: i32,
    pub y: i32,
    pub color: String,
}

/// Full pixel record. Mirrors the `pixels` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPixel {
    pub x: i32,
    pub y: i32,
    pub color: String,
    pub last_update: i64,
}

impl StoredPixel {
    #[must_use]
    pub fn coord(&self) -> Coord {
        Coord { x: self.x, y: self.y }
    }
}

/// Observability snapshot of the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CanvasStats {
    pub active_count: usize,
    pub total_capacity: u64,
    /// Percentage of the grid that costs no memory (default pixels).
    pub memory_efficiency: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

// =============================================================================
// STORE
// =============================================================================

pub struct CanvasStore {
    width: u32,
    height: u32,
    default_color: String,
    pixels: HashMap<Coord, Pixel>,
    /// `None` means dirty.
    active_cache: Option<Arc<[ActivePixel]>>,
    cache_hits: u64,
    cache_misses: u64,
}

impl CanvasStore {
    #[must_use]
    pub fn new(width: u32, height: u32, default_color: impl Into<String>) -> Self {
        Self {
            width,
            height,
            default_color: default_color.into(),
            pixels: HashMap::new(),
            active_cache: None,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Resolve raw coordinates into a [`Coord`], or `None` when out of bounds.
    #[must_use]
    pub fn coord(&self, x: i64, y: i64) -> Option<Coord> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return None;
        }
        Some(Coord { x: i32::try_from(x).ok()?, y: i32::try_from(y).ok()? })
    }

    /// Paint one pixel. Returns whether the effective color changed.
    ///
    /// Out-of-bounds writes return `false` and leave the store untouched.
    /// Painting the default color erases the entry.
    pub fn set_pixel(&mut self, x: i64, y: i64, color: &str, timestamp: i64) -> bool {
        let Some(coord) = self.coord(x, y) else {
            return false;
        };

        let previous = self
            .pixels
            .get(&coord)
            .map_or(self.default_color.as_str(), |p| p.color.as_str());
        if previous == color {
            // Redundant repaint: keep the original timestamp and the cache.
            return false;
        }

        if color == self.default_color {
            self.pixels.remove(&coord);
        } else {
            self.pixels
                .insert(coord, Pixel { color: color.to_owned(), last_update: timestamp });
        }
        self.active_cache = None;
        true
    }

    /// Read one pixel. Absent and out-of-bounds coordinates yield the default pixel.
    #[must_use]
    pub fn get_pixel(&self, x: i64, y: i64) -> Pixel {
        self.coord(x, y)
            .and_then(|coord| self.pixels.get(&coord))
            .cloned()
            .unwrap_or_else(|| self.default_pixel())
    }

    /// Snapshot of every non-default pixel, ordered by row then column.
    pub fn active_pixels(&mut self) -> Arc<[ActivePixel]> {
        if let Some(cached) = &self.active_cache {
            self.cache_hits += 1;
            return Arc::clone(cached);
        }

        self.cache_misses += 1;
        let mut coords: Vec<(&Coord, &Pixel)> = self.pixels.iter().collect();
        coords.sort_unstable_by_key(|(coord, _)| (coord.y, coord.x));
        let rebuilt: Arc<[ActivePixel]> = coords
            .into_iter()
            .map(|(coord, pixel)| ActivePixel { x: coord.x, y: coord.y, color: pixel.color.clone() })
            .collect();
        self.active_cache = Some(Arc::clone(&rebuilt));
        rebuilt
    }

    /// Load a persisted snapshot. Later duplicates win; out-of-bounds rows are
    /// skipped. Returns the number of rows applied.
    pub fn bulk_load<I>(&mut self, pixels: I) -> usize
    where
        I: IntoIterator<Item = StoredPixel>,
    {
        let mut applied = 0;
        for pixel in pixels {
            let Some(coord) = self.coord(i64::from(pixel.x), i64::from(pixel.y)) else {
                continue;
            };
            if pixel.color == self.default_color {
                self.pixels.remove(&coord);
            } else {
                self.pixels
                    .insert(coord, Pixel { color: pixel.color, last_update: pixel.last_update });
            }
            applied += 1;
        }
        self.active_cache = None;
        applied
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.pixels.len()
    }

    #[must_use]
    pub fn stats(&self) -> CanvasStats {
        let total_capacity = u64::from(self.width) * u64::from(self.height);
        let active = self.active_count();
        #[allow(clippy::cast_precision_loss)]
        let memory_efficiency = if total_capacity == 0 {
            100.0
        } else {
            (1.0 - active as f64 / total_capacity as f64) * 100.0
        };
        CanvasStats {
            active_count: active,
            total_capacity,
            memory_efficiency,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
        }
    }

    fn default_pixel(&self) -> Pixel {
        Pixel { color: self.default_color.clone(), last_update: 0 }
    }
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
