//! Runtime configuration.
//!
//! DESIGN
//! ======
//! Three layers, last wins: built-in defaults, an optional JSON file
//! (`CONFIG_PATH`, default `config.json`), then environment variables. A
//! missing or malformed file is logged and ignored so a bare deployment
//! still boots with defaults; a config that fails [`AppConfig::validate`]
//! is a startup error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

const DEFAULT_CONFIG_PATH: &str = "config.json";

const DEFAULT_PALETTE: [&str; 16] = [
    "#FFFFFF", "#E4E4E4", "#888888", "#222222", "#FFA7D1", "#E50000", "#E59500", "#A06A42", "#E5D900", "#94E044",
    "#02BE01", "#00D3DD", "#0083C7", "#0000EA", "#CF6EE4", "#820080",
];

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("canvas dimensions must be between 1 and {max} (got {width}x{height})", max = i32::MAX)]
    InvalidDimensions { width: u32, height: u32 },
    #[error("invalid color {0:?}: expected #RRGGBB")]
    InvalidColor(String),
    #[error("{0} must be at least 1")]
    ZeroSetting(&'static str),
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,
    /// Seconds between accepted edits per client.
    pub cooldown_time: u64,
    pub default_color: String,
    pub colors: Vec<String>,
    /// Restrict edits to `colors` instead of any `#RRGGBB`.
    pub enforce_palette: bool,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 2000,
            height: 600,
            cooldown_time: 60,
            default_color: "#FFFFFF".into(),
            colors: DEFAULT_PALETTE.iter().map(|c| (*c).to_owned()).collect(),
            enforce_palette: false,
        }
    }
}

impl CanvasConfig {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_time)
    }

    /// Canonicalize and validate an edit color against the active policy.
    #[must_use]
    pub fn accept_color(&self, raw: &str) -> Option<String> {
        let color = canonical_color(raw)?;
        if self.enforce_palette && !self.colors.iter().any(|c| c.eq_ignore_ascii_case(&color)) {
            return None;
        }
        Some(color)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Pending writes that trigger an immediate flush.
    pub batch_size: usize,
    /// Maximum age of the oldest unflushed write, in milliseconds.
    pub flush_interval_ms: u64,
    /// Bounded queue between websocket tasks and the writer.
    pub queue_capacity: usize,
    pub retries: usize,
    pub retry_base_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 1000,
            queue_capacity: 8192,
            retries: 2,
            retry_base_ms: 20,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub flush_interval_secs: u64,
    pub stats_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub cleanup_age_days: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { flush_interval_secs: 30, stats_interval_secs: 300, cleanup_interval_secs: 3600, cleanup_age_days: 7 }
    }
}

impl MaintenanceConfig {
    #[must_use]
    pub fn cleanup_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_age_days.saturating_mul(24 * 3600))
    }
}

// =============================================================================
// APP CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: Option<PathBuf>,
    pub canvas: CanvasConfig,
    pub persistence: PersistConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            static_dir: None,
            canvas: CanvasConfig::default(),
            persistence: PersistConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve defaults, the JSON file at `CONFIG_PATH`, and env overrides.
    #[must_use]
    pub fn load() -> Self {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file(Path::new(&path));
        config.apply_env();
        config
    }

    /// Read the JSON config file, falling back to defaults on any failure.
    #[must_use]
    pub fn from_file(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found; using defaults");
                return Self::default();
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "config file unreadable; using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "invalid JSON in config file; using defaults");
                Self::default()
            }
        }
    }

    /// Overlay environment variables on top of the current values.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.host = host;
        }
        self.port = env_parse("PORT", self.port);
        if let Ok(dir) = std::env::var("STATIC_DIR") {
            self.static_dir = Some(PathBuf::from(dir));
        }

        let canvas = &mut self.canvas;
        canvas.width = env_parse("CANVAS_WIDTH", canvas.width);
        canvas.height = env_parse("CANVAS_HEIGHT", canvas.height);
        canvas.cooldown_time = env_parse("COOLDOWN_TIME", canvas.cooldown_time);
        canvas.enforce_palette = env_flag("ENFORCE_PALETTE", canvas.enforce_palette);
        if let Ok(color) = std::env::var("DEFAULT_COLOR") {
            canvas.default_color = color;
        }

        let persist = &mut self.persistence;
        persist.batch_size = env_parse("PIXEL_BATCH_SIZE", persist.batch_size);
        persist.flush_interval_ms = env_parse("PIXEL_FLUSH_INTERVAL_MS", persist.flush_interval_ms);
        persist.queue_capacity = env_parse("PIXEL_QUEUE_CAPACITY", persist.queue_capacity);
        persist.retries = env_parse("PIXEL_PERSIST_RETRIES", persist.retries);
        persist.retry_base_ms = env_parse("PIXEL_PERSIST_RETRY_BASE_MS", persist.retry_base_ms);
        persist.shutdown_timeout_secs = env_parse("SHUTDOWN_FLUSH_TIMEOUT_SECS", persist.shutdown_timeout_secs);

        let maint = &mut self.maintenance;
        maint.flush_interval_secs = env_parse("MAINTENANCE_FLUSH_SECS", maint.flush_interval_secs);
        maint.stats_interval_secs = env_parse("MAINTENANCE_STATS_SECS", maint.stats_interval_secs);
        maint.cleanup_interval_secs = env_parse("MAINTENANCE_CLEANUP_SECS", maint.cleanup_interval_secs);
        maint.cleanup_age_days = env_parse("CLEANUP_AGE_DAYS", maint.cleanup_age_days);
    }

    /// Check invariants and canonicalize colors in place.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first invalid setting.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let canvas = &mut self.canvas;
        let max = u32::try_from(i32::MAX).unwrap_or(u32::MAX);
        if canvas.width == 0 || canvas.height == 0 || canvas.width > max || canvas.height > max {
            return Err(ConfigError::InvalidDimensions { width: canvas.width, height: canvas.height });
        }

        canvas.default_color = canonical_color(&canvas.default_color)
            .ok_or_else(|| ConfigError::InvalidColor(canvas.default_color.clone()))?;
        canvas.colors = canvas
            .colors
            .iter()
            .map(|c| canonical_color(c).ok_or_else(|| ConfigError::InvalidColor(c.clone())))
            .collect::<Result<_, _>>()?;

        if self.persistence.batch_size == 0 {
            return Err(ConfigError::ZeroSetting("persistence.batch_size"));
        }
        if self.persistence.queue_capacity == 0 {
            return Err(ConfigError::ZeroSetting("persistence.queue_capacity"));
        }
        if self.persistence.retries == 0 {
            return Err(ConfigError::ZeroSetting("persistence.retries"));
        }
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    raw.parse::<T>().unwrap_or_else(|_| {
        warn!(key, value = %raw, "ignoring unparsable environment override");
        default
    })
}

/// Boolean override accepting `true/false`, `1/0`, `yes/no` and `on/off`.
pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value = %raw, "ignoring unparsable boolean environment override");
            default
        }
    }
}

/// Upper-case `#RRGGBB`, or `None` for anything else.
#[must_use]
pub fn canonical_color(raw: &str) -> Option<String> {
    let hex = raw.strip_prefix('#')?;
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("#{}", hex.to_ascii_uppercase()))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
