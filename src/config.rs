//! Configuration management for ert-sched.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`ERT_SCHED_POLL_MS`, etc.)
//! 2. Project-local config file (`./ert-sched.toml`)
//! 3. User config file (`~/.config/ert-sched/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # ert-sched.toml
//!
//! # Scheduler wakes at least this often to re-check hardware state
//! poll_interval_ms = 20
//!
//! # Command queue size in bytes (slot count = cq_size / slot_size)
//! cq_size = 65536
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Global cached configuration.
static CONFIG: OnceLock<SchedConfig> = OnceLock::new();

/// Default bounded wait of the scheduler thread.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20;

/// Default command queue size (64K).
pub const DEFAULT_CQ_SIZE: u32 = 0x10000;

/// Default XGQ submission slot size.
pub const DEFAULT_XGQ_SLOT_SIZE: u32 = 512;

/// Default wait for a synchronous XGQ command.
pub const DEFAULT_XGQ_TIMEOUT_MS: u64 = 10_000;

/// ert-sched configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SchedConfig {
    /// Upper bound on how long the scheduler thread sleeps without a signal.
    pub poll_interval_ms: Option<u64>,

    /// Size of the embedded command queue in bytes.
    pub cq_size: Option<u32>,

    /// Always dispatch from the host, even if an embedded processor exists.
    pub force_penguin: Option<bool>,

    /// Size of one XGQ submission slot in bytes.
    pub xgq_slot_size: Option<u32>,

    /// How long a synchronous XGQ command may stay unacknowledged.
    pub xgq_timeout_ms: Option<u64>,
}

impl SchedConfig {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `ert-sched.toml`
    /// 3. User config `~/.config/ert-sched/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static SchedConfig {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Scheduler wait bound.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS).max(1))
    }

    /// Command queue size in bytes.
    pub fn cq_size(&self) -> u32 {
        self.cq_size.unwrap_or(DEFAULT_CQ_SIZE)
    }

    /// Whether the embedded processor is ignored.
    pub fn force_penguin(&self) -> bool {
        self.force_penguin.unwrap_or(false)
    }

    /// XGQ submission slot size.
    pub fn xgq_slot_size(&self) -> u32 {
        self.xgq_slot_size.unwrap_or(DEFAULT_XGQ_SLOT_SIZE)
    }

    /// Wait bound for synchronous XGQ commands.
    pub fn xgq_timeout(&self) -> Duration {
        Duration::from_millis(self.xgq_timeout_ms.unwrap_or(DEFAULT_XGQ_TIMEOUT_MS))
    }

    /// Load user configuration from ~/.config/ert-sched/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./ert-sched.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("ert-sched.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("ert-sched.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    pub fn merge(&mut self, other: Self) {
        if other.poll_interval_ms.is_some() {
            self.poll_interval_ms = other.poll_interval_ms;
        }
        if other.cq_size.is_some() {
            self.cq_size = other.cq_size;
        }
        if other.force_penguin.is_some() {
            self.force_penguin = other.force_penguin;
        }
        if other.xgq_slot_size.is_some() {
            self.xgq_slot_size = other.xgq_slot_size;
        }
        if other.xgq_timeout_ms.is_some() {
            self.xgq_timeout_ms = other.xgq_timeout_ms;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse::<u64>("ERT_SCHED_POLL_MS") {
            self.poll_interval_ms = Some(ms);
        }
        if let Some(size) = env_parse::<u32>("ERT_SCHED_CQ_SIZE") {
            self.cq_size = Some(size);
        }
        if let Some(flag) = env_parse::<bool>("ERT_SCHED_PENGUIN") {
            self.force_penguin = Some(flag);
        }
        if let Some(size) = env_parse::<u32>("ERT_SCHED_XGQ_SLOT_SIZE") {
            self.xgq_slot_size = Some(size);
        }
        if let Some(ms) = env_parse::<u64>("ERT_SCHED_XGQ_TIMEOUT_MS") {
            self.xgq_timeout_ms = Some(ms);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ert-sched").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# ert-sched configuration
# Place this file at ~/.config/ert-sched/config.toml or ./ert-sched.toml

# Scheduler wakes at least this often (milliseconds) to re-check hardware
poll_interval_ms = 20

# Embedded command queue size in bytes
cq_size = 65536

# Dispatch from the host even when an embedded processor is present
# force_penguin = false

# XGQ submission slot size in bytes (multiple of 4)
# xgq_slot_size = 512

# Wait bound for synchronous XGQ commands such as image load
# xgq_timeout_ms = 10000
"#
        .to_string()
    }
}

/// Parse an environment variable, logging the override or a bad value.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => {
            log::info!("Using {} from environment: {}", name, raw);
            Some(value)
        }
        Err(_) => {
            log::warn!("Ignoring {}: cannot parse '{}'", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.cq_size(), 0x10000);
        assert!(!config.force_penguin());
        assert_eq!(config.xgq_slot_size(), 512);
        assert_eq!(config.xgq_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_merge() {
        let mut base = SchedConfig {
            poll_interval_ms: Some(5),
            cq_size: None,
            force_penguin: Some(false),
            ..Default::default()
        };

        let overlay = SchedConfig {
            poll_interval_ms: None,
            cq_size: Some(0x2000),
            force_penguin: Some(true),
            ..Default::default()
        };

        base.merge(overlay);

        // poll interval unchanged (overlay was None)
        assert_eq!(base.poll_interval_ms, Some(5));
        assert_eq!(base.cq_size, Some(0x2000));
        assert_eq!(base.force_penguin, Some(true));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = SchedConfig {
            poll_interval_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = SchedConfig::sample_config();
        let parsed: SchedConfig = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(parsed.poll_interval_ms, Some(20));
        assert_eq!(parsed.cq_size, Some(65536));
        assert_eq!(parsed.force_penguin, None);
    }
}
