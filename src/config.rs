//! Application configuration.
//!
//! Read from a TOML file, then overridden from `STATESYNC_*` environment
//! variables, then validated.

use crate::error::{Result, SyncError};
use crate::manager::{LockTiming, StateManagerMode};
use crate::minify::{MinifyMode, MinifyToggles, ENV_MINIFY_EVENTS, ENV_MINIFY_STATES, ENV_MINIFY_VARS, MINIFY_JSON};
use crate::state::ResolutionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default config file name.
pub const CONFIG_TOML: &str = "statesync.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app_name: String,

    pub state_manager_mode: StateManagerMode,

    /// Directory for the disk backend.
    pub state_dir: PathBuf,

    /// Blobs kept in memory by the disk backend.
    pub state_cache_size: usize,

    pub lock_expiration_ms: u64,
    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,

    /// Lifetime of stored trees in the disk and cache backends.
    pub token_expiration_secs: u64,

    pub minify_path: PathBuf,
    pub minify_states: MinifyMode,
    pub minify_events: MinifyMode,
    pub minify_vars: MinifyMode,

    pub resolution: ResolutionPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "app".to_string(),
            state_manager_mode: StateManagerMode::Memory,
            state_dir: PathBuf::from(".states"),
            state_cache_size: 256,
            lock_expiration_ms: 10_000,
            lock_timeout_ms: 10_000,
            lock_poll_interval_ms: 10,
            token_expiration_secs: 3_600,
            minify_path: PathBuf::from(MINIFY_JSON),
            minify_states: MinifyMode::Disabled,
            minify_events: MinifyMode::Disabled,
            minify_vars: MinifyMode::Disabled,
            resolution: ResolutionPolicy::Backtrack,
        }
    }
}

impl AppConfig {
    /// Load `path` if it exists (defaults otherwise), apply environment
    /// overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            Self::from_toml(&text)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `STATESYNC_*` variables supplied by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("STATESYNC_APP_NAME") {
            self.app_name = v;
        }
        if let Some(v) = lookup("STATESYNC_STATE_MANAGER_MODE") {
            self.state_manager_mode = match v.trim().to_ascii_lowercase().as_str() {
                "memory" => StateManagerMode::Memory,
                "disk" => StateManagerMode::Disk,
                "cache" => StateManagerMode::Cache,
                other => {
                    return Err(SyncError::ConfigValidation(format!(
                        "invalid state manager mode {other:?}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("STATESYNC_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STATESYNC_MINIFY_PATH") {
            self.minify_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("STATESYNC_LOCK_EXPIRATION_MS") {
            self.lock_expiration_ms = parse_env("STATESYNC_LOCK_EXPIRATION_MS", &v)?;
        }
        if let Some(v) = lookup("STATESYNC_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = parse_env("STATESYNC_LOCK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("STATESYNC_TOKEN_EXPIRATION_SECS") {
            self.token_expiration_secs = parse_env("STATESYNC_TOKEN_EXPIRATION_SECS", &v)?;
        }
        if let Some(v) = lookup(ENV_MINIFY_STATES) {
            self.minify_states = MinifyMode::from_str(&v)?;
        }
        if let Some(v) = lookup(ENV_MINIFY_EVENTS) {
            self.minify_events = MinifyMode::from_str(&v)?;
        }
        if let Some(v) = lookup(ENV_MINIFY_VARS) {
            self.minify_vars = MinifyMode::from_str(&v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_expiration_ms == 0 {
            return Err(SyncError::ConfigValidation(
                "lock_expiration_ms must be greater than 0".into(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(SyncError::ConfigValidation(
                "lock_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.lock_poll_interval_ms == 0 {
            return Err(SyncError::ConfigValidation(
                "lock_poll_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timing(&self) -> LockTiming {
        LockTiming {
            expiration: Duration::from_millis(self.lock_expiration_ms),
            timeout: Duration::from_millis(self.lock_timeout_ms),
            poll_interval: Duration::from_millis(self.lock_poll_interval_ms),
        }
    }

    pub fn token_expiration(&self) -> Duration {
        Duration::from_secs(self.token_expiration_secs)
    }

    pub fn minify_toggles(&self) -> MinifyToggles {
        MinifyToggles {
            states: self.minify_states,
            events: self.minify_events,
            vars: self.minify_vars,
        }
    }
}

fn parse_env(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::ConfigValidation(format!("{key} must be an integer, got {value:?}")))
}
