//! Router Configuration
//!
//! Loaded once at startup from a JSON file and swapped atomically on
//! reload. Reservations granted against a previous snapshot keep
//! referencing the buckets they were granted on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::ConfigError;
use crate::lane::Lane;

/// Default quota window length (one hour)
pub const DEFAULT_WINDOW_SECS: u64 = 3600;
/// Default reservation grace period before abandonment
pub const DEFAULT_GRACE_SECS: u64 = 120;
/// Default consecutive upstream failures before a lane opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
/// Default circuit-breaker cooldown
pub const DEFAULT_COOLDOWN_SECS: u64 = 30;

/// Circuit-breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive upstream failures that open the lane
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open lane is skipped before being retried
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_cooldown_secs() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}

impl BreakerConfig {
    /// Cooldown as a duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// One upstream lane with its per-model token limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Lane identifier (closed set, unknown names fail deserialization)
    pub lane: Lane,

    /// Model name -> token budget per window
    pub models: HashMap<String, u64>,
}

/// Full router configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Lanes in priority order; the first eligible lane wins
    pub lanes: Vec<LaneConfig>,

    /// Quota window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Reservation grace period in seconds
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Circuit-breaker thresholds
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Enable the synthetic-usage dev endpoint (off by default)
    #[serde(default)]
    pub dev_harness_enabled: bool,

    /// Append-only usage log destination
    #[serde(default = "default_usage_log_path")]
    pub usage_log_path: PathBuf,
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_grace_secs() -> u64 {
    DEFAULT_GRACE_SECS
}

fn default_usage_log_path() -> PathBuf {
    PathBuf::from("logs/usage.jsonl")
}

impl RouterConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: RouterConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would misbehave at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes.is_empty() {
            return Err(ConfigError::Invalid("at least one lane is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for lane_cfg in &self.lanes {
            if !seen.insert(lane_cfg.lane) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate lane: {}",
                    lane_cfg.lane
                )));
            }
            for (model, limit) in &lane_cfg.models {
                if *limit == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "zero token limit for {}/{}",
                        lane_cfg.lane, model
                    )));
                }
            }
        }
        if self.window_secs == 0 {
            return Err(ConfigError::Invalid("window_secs must be positive".into()));
        }
        if self.grace_secs == 0 {
            return Err(ConfigError::Invalid("grace_secs must be positive".into()));
        }
        Ok(())
    }

    /// Quota window length
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }

    /// Reservation grace period
    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs as i64)
    }

    /// Token limit for a (lane, model) pair, if configured
    pub fn limit(&self, lane: Lane, model: &str) -> Option<u64> {
        self.lanes
            .iter()
            .find(|l| l.lane == lane)
            .and_then(|l| l.models.get(model).copied())
    }

    /// Lanes carrying the given model, in priority order
    pub fn lanes_for_model<'a>(&'a self, model: &'a str) -> impl Iterator<Item = Lane> + 'a {
        self.lanes
            .iter()
            .filter(move |l| l.models.contains_key(model))
            .map(|l| l.lane)
    }
}

/// Atomically swappable configuration handle
///
/// Readers take a cheap `Arc` clone of the current snapshot; a reload
/// replaces the snapshot without touching readers mid-request.
#[derive(Debug)]
pub struct ConfigHandle {
    inner: RwLock<Arc<RouterConfig>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration snapshot
    pub fn new(config: RouterConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<RouterConfig> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Swap in a new snapshot, returning the previous one
    pub fn swap(&self, config: RouterConfig) -> Arc<RouterConfig> {
        let mut guard = self.inner.write().expect("config lock poisoned");
        std::mem::replace(&mut *guard, Arc::new(config))
    }
}
