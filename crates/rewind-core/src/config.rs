//! Configuration management for Rewind
//!
//! Stores configuration in OS-appropriate locations:
//! - macOS: ~/Library/Application Support/rewind/config.toml
//! - Linux: ~/.config/rewind/config.toml
//! - Windows: %APPDATA%\rewind\config.toml

use crate::models::Mode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Rewind configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RewindConfig {
    /// Operating mode
    #[serde(default)]
    pub mode: Mode,

    /// Capture (record mode) configuration
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Replay (test mode) configuration
    #[serde(default)]
    pub replay: ReplaySettings,
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// How long a connection may stay silent before it is reaped
    #[serde(default = "default_inactivity_threshold_ms")]
    pub inactivity_threshold_ms: u64,

    /// Interval between tracker sweeps
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Per-direction buffer limit; larger streams are treated as malformed
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Port the record-mode tunnel listens on
    #[serde(default = "default_capture_port")]
    pub listen_port: u16,

    /// Upstream `host:port` the tunnel forwards to
    #[serde(default)]
    pub upstream: Option<String>,

    /// JSON-lines file recorded test cases are appended to
    #[serde(default = "default_tests_path")]
    pub tests_path: PathBuf,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            inactivity_threshold_ms: default_inactivity_threshold_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_buffer_size: default_max_buffer_size(),
            listen_port: default_capture_port(),
            upstream: None,
            tests_path: default_tests_path(),
        }
    }
}

impl CaptureSettings {
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_inactivity_threshold_ms() -> u64 {
    5_000
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_max_buffer_size() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_capture_port() -> u16 {
    16789
}

fn default_tests_path() -> PathBuf {
    PathBuf::from("rewind-tests.jsonl")
}

/// Replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySettings {
    /// Port the replay listener accepts connections on
    #[serde(default = "default_replay_port")]
    pub listen_port: u16,

    /// JSON file holding the mock pool
    #[serde(default)]
    pub mocks_path: Option<PathBuf>,

    /// Read buffer size per connection
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Binary similarity tuning
    #[serde(default)]
    pub shingles: ShingleSettings,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            listen_port: default_replay_port(),
            mocks_path: None,
            read_buffer_size: default_read_buffer_size(),
            shingles: ShingleSettings::default(),
        }
    }
}

fn default_replay_port() -> u16 {
    16790
}

fn default_read_buffer_size() -> usize {
    32 * 1024 // 32 KB
}

/// Adaptive shingle length: `clamp(len / divisor, k_min, k_max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShingleSettings {
    #[serde(default = "default_divisor")]
    pub divisor: usize,

    #[serde(default = "default_k_min")]
    pub k_min: usize,

    #[serde(default = "default_k_max")]
    pub k_max: usize,
}

impl Default for ShingleSettings {
    fn default() -> Self {
        Self {
            divisor: default_divisor(),
            k_min: default_k_min(),
            k_max: default_k_max(),
        }
    }
}

fn default_divisor() -> usize {
    5
}

fn default_k_min() -> usize {
    3
}

fn default_k_max() -> usize {
    8
}

impl RewindConfig {
    /// Get the config file path for the current OS
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("rewind");

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from disk, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Load config and merge with environment variables
    /// Environment variables take precedence over config file
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `REWIND_*` overrides using the given lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("REWIND_MODE") {
            self.mode = mode
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Invalid REWIND_MODE")?;
        }

        if let Some(path) = lookup("REWIND_MOCKS_PATH") {
            self.replay.mocks_path = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("REWIND_TESTS_PATH") {
            self.capture.tests_path = PathBuf::from(path);
        }

        Ok(())
    }
}
