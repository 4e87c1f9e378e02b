//! Pixel edit pipeline.
//!
//! DESIGN
//! ======
//! `apply_edit` is the whole accept path for one `pixel_update`:
//! shutdown gate, cooldown, bounds, color, canvas write, cooldown record,
//! fan-out, then persistence enqueue.
//!
//! Everything, enqueue included, runs under the canvas lock. That makes
//! check-then-record atomic per client and keeps fan-out order equal to
//! acceptance order across coordinates. Enqueue is a `try_send` and never
//! blocks.
//!
//! The shutdown gate is checked again once the lock is held. After
//! `begin_shutdown`, taking and releasing the canvas lock once is therefore a
//! barrier: every edit accepted before it is already in the persistence queue.

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::canvas::StoredPixel;
use crate::protocol::{PixelEdit, ServerMessage};
use crate::state::AppState;

/// Policy violations. `Display` is the user-visible reply text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Wait {:.1} seconds between pixels", .0.as_secs_f64())]
    Cooldown(Duration),
    #[error("Invalid pixel coordinates")]
    OutOfBounds,
    #[error("Invalid pixel color")]
    InvalidColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Color changed; broadcast and queued for persistence.
    Applied,
    /// Repaint with the current color. Cooldown still consumed.
    Unchanged,
}

/// Validate and apply one edit from `client_id` at `now` (ms since epoch).
///
/// # Errors
///
/// Returns an [`EditError`] naming the violated policy. Nothing is mutated
/// and no cooldown is consumed on error.
pub fn apply_edit(state: &AppState, client_id: Uuid, edit: &PixelEdit, now: i64) -> Result<EditOutcome, EditError> {
    if !state.is_accepting() {
        return Err(EditError::ShuttingDown);
    }

    let mut canvas = state.lock_canvas();
    if !state.is_accepting() {
        return Err(EditError::ShuttingDown);
    }

    if !state.rate_limiter.allow(client_id, now) {
        return Err(EditError::Cooldown(state.rate_limiter.remaining(client_id, now)));
    }
    let coord = canvas.coord(edit.x, edit.y).ok_or(EditError::OutOfBounds)?;
    let color = state.config.canvas.accept_color(&edit.color).ok_or(EditError::InvalidColor)?;

    let changed = canvas.set_pixel(edit.x, edit.y, &color, now);
    state.rate_limiter.record(client_id, now);
    if !changed {
        debug!(%client_id, x = coord.x, y = coord.y, "pixel: redundant repaint");
        return Ok(EditOutcome::Unchanged);
    }

    state.broadcaster.fanout(&ServerMessage::PixelUpdate { x: coord.x, y: coord.y, color: color.clone() });
    state.persistence.enqueue(StoredPixel { x: coord.x, y: coord.y, color, last_update: now });
    drop(canvas);
    Ok(EditOutcome::Applied)
}

#[cfg(test)]
#[path = "pixel_test.rs"]
mod tests;
