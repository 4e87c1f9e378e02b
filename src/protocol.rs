//! Wire protocol — JSON text frames exchanged over the websocket.
//!
//! DESIGN
//! ======
//! Every frame is an object with a `type` tag. Inbound frames are decoded at
//! the boundary into the closed [`ClientMessage`] enum so dispatch is an
//! exhaustive `match`; anything that does not fit becomes a
//! [`ProtocolError`] whose `Display` is the user-visible error text.
//!
//! Decoding is two-step (tag first, then payload) so an unknown `type` and a
//! malformed `pixel_update` produce different error replies.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canvas::{ActivePixel, CanvasStats};

// =============================================================================
// INBOUND
// =============================================================================

/// Decoded client → server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    PixelUpdate(PixelEdit),
    /// Keep-alive. The timestamp is echoed back verbatim, whatever its type.
    Ping { timestamp: serde_json::Value },
    GetStats,
}

/// Payload of an inbound `pixel_update`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PixelEdit {
    pub x: i64,
    pub y: i64,
    pub color: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Invalid message structure")]
    InvalidStructure,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid pixel data")]
    InvalidPixelData,
    #[error("Binary frames are not supported")]
    Binary,
}

impl ClientMessage {
    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for unparsable JSON, a missing or
    /// non-string `type`, an unknown kind, or a malformed payload.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
            return Err(ProtocolError::InvalidStructure);
        };

        match kind {
            "pixel_update" => {
                let edit = PixelEdit::deserialize(&value).map_err(|_| ProtocolError::InvalidPixelData)?;
                Ok(Self::PixelUpdate(edit))
            }
            "ping" => {
                let timestamp = value
                    .get("timestamp")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                Ok(Self::Ping { timestamp })
            }
            "get_stats" => Ok(Self::GetStats),
            other => Err(ProtocolError::UnknownType(other.to_owned())),
        }
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Server → client frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Init { pixels: Arc<[ActivePixel]>, online_users: usize, canvas_info: CanvasInfo },
    PixelUpdate { x: i32, y: i32, color: String },
    UserCount { count: usize },
    Error { message: String },
    Pong { timestamp: serde_json::Value },
    StatsResponse { stats: SessionStats },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasInfo {
    pub width: u32,
    pub height: u32,
    /// Seconds.
    pub cooldown_time: u64,
}

/// Payload of `stats_response`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub canvas: CanvasSummary,
    pub connections: ConnectionSummary,
    pub persistence: PersistSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanvasSummary {
    pub canvas_size: String,
    pub active_pixels: usize,
    pub total_capacity: u64,
    pub memory_efficiency: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_colors: usize,
}

impl CanvasSummary {
    #[must_use]
    pub fn new(info: CanvasInfo, stats: CanvasStats, total_colors: usize) -> Self {
        Self {
            canvas_size: format!("{}x{}", info.width, info.height),
            active_pixels: stats.active_count,
            total_capacity: stats.total_capacity,
            memory_efficiency: stats.memory_efficiency,
            cache_hits: stats.cache_hits,
            cache_misses: stats.cache_misses,
            total_colors,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionSummary {
    pub active: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub your_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub pending_writes: usize,
    pub flushed_total: u64,
    pub dropped_total: u64,
}

impl ServerMessage {
    /// Error reply carrying an error's `Display` text.
    #[must_use]
    pub fn error(err: &impl std::fmt::Display) -> Self {
        Self::Error { message: err.to_string() }
    }

    /// Serialize to the text sent over the socket.
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialization failures.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
