//! Daemon configuration
//!
//! Loaded from `herald.toml`. Every section falls back to defaults, so an
//! empty or missing file yields a working single-site setup.

use std::path::{Path, PathBuf};

use chrono::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{PayloadRef, TaskType};
use crate::registry::ZoneRegistry;

/// Default TCP port for Herald servers
pub const DEFAULT_PORT: u16 = 7341;

/// Speaking rate used to estimate how long text takes to read out
const SPEECH_MS_PER_WORD: u64 = 400;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    pub server: ServerConfig,
    /// Concrete output zones in display order
    pub zones: ZonesConfig,
    pub timing: TimingConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connections: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonesConfig {
    pub names: Vec<String>,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            names: vec![
                "Admin Office".to_string(),
                "Main Hall".to_string(),
                "Library".to_string(),
                "Classrooms".to_string(),
            ],
        }
    }
}

/// Liveness and preparation timings, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Expected heartbeat period for voice and text tasks
    pub heartbeat_interval_ms: u64,
    /// Expected heartbeat period for background music players
    pub background_heartbeat_interval_ms: u64,
    /// A task is abandoned after this many intervals without a heartbeat
    pub missed_heartbeats: u32,
    /// Intro chime length before content starts
    pub preparation_delay_ms: u64,
    /// Liveness sweep period
    pub sweep_interval_ms: u64,
    /// How long a released task stays visible to observers
    pub released_retention_ms: u64,
    /// Assumed length of scheduled audio that arrives without a duration
    pub scheduled_fallback_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            background_heartbeat_interval_ms: 15_000,
            missed_heartbeats: 2,
            preparation_delay_ms: 5_000,
            sweep_interval_ms: 1_000,
            released_retention_ms: 30_000,
            scheduled_fallback_ms: 120_000,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self, task_type: TaskType) -> Duration {
        let ms = match task_type {
            TaskType::Background => self.background_heartbeat_interval_ms,
            _ => self.heartbeat_interval_ms,
        };
        millis(ms)
    }

    /// Silence after which a task is presumed abandoned
    pub fn liveness_timeout(&self, task_type: TaskType) -> Duration {
        self.heartbeat_interval(task_type) * self.missed_heartbeats as i32
    }

    /// Grace window granted at admission
    pub fn preparation_for(&self, task_type: TaskType) -> Duration {
        if task_type.has_preparation() {
            millis(self.preparation_delay_ms)
        } else {
            Duration::zero()
        }
    }

    /// Estimated play time of server-played content with no known length.
    /// Text is timed by word count, never longer than the fallback.
    pub fn estimated_duration_ms(&self, payload: &PayloadRef) -> u64 {
        match payload {
            PayloadRef::Text { content, .. } | PayloadRef::Alert { script: content } => {
                let words = content.split_whitespace().count() as u64;
                (words.max(1) * SPEECH_MS_PER_WORD).min(self.scheduled_fallback_ms)
            }
            PayloadRef::Audio { .. } | PayloadRef::LiveStream => self.scheduled_fallback_ms,
        }
    }

    pub fn released_retention(&self) -> Duration {
        millis(self.released_retention_ms)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    /// Give the lock back to preempted background music when it frees up
    pub resume_background: bool,
    /// Push pending announcements later by the length of live interruptions
    pub shift_on_interruption: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            resume_background: true,
            shift_on_interruption: true,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_ms)
    }
}

impl HeraldConfig {
    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: HeraldConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from a file if it exists, else use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Platform config location (`.../herald/herald.toml`)
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "herald", "herald").ok_or_else(|| {
            Error::Config("Could not determine configuration directory".into())
        })?;
        Ok(dirs.config_dir().join("herald.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.timing;
        if t.heartbeat_interval_ms == 0 || t.background_heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat intervals must be non-zero".into()));
        }
        if t.scheduled_fallback_ms == 0 {
            return Err(Error::Config("scheduled_fallback_ms must be non-zero".into()));
        }
        if t.missed_heartbeats == 0 {
            return Err(Error::Config("missed_heartbeats must be at least 1".into()));
        }
        if t.sweep_interval_ms == 0 || self.scheduler.tick_ms == 0 {
            return Err(Error::Config("loop periods must be non-zero".into()));
        }
        if self.server.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        ZoneRegistry::new(self.zones.names.clone())
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Render as TOML, e.g. to seed a new configuration file
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn zone_registry(&self) -> Result<ZoneRegistry> {
        ZoneRegistry::new(self.zones.names.clone())
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
