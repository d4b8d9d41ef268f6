//! Identifier minification.
//!
//! State ids, handler names and field names can be replaced on the wire by
//! short sibling-scoped identifiers taken from a `minify.json` table. Each of
//! the three kinds has its own toggle, and a toggle only takes effect when a
//! table is present.

pub mod compact;
pub mod config;
pub mod naming;

pub use compact::{compact_to_int, int_to_compact};
pub use config::{MinifyConfig, ValidationReport, MINIFY_JSON, SCHEMA_VERSION};
pub use naming::Schema;

use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Environment switch for state id minification.
pub const ENV_MINIFY_STATES: &str = "STATESYNC_MINIFY_STATES";
/// Environment switch for handler name minification.
pub const ENV_MINIFY_EVENTS: &str = "STATESYNC_MINIFY_EVENTS";
/// Environment switch for field name minification.
pub const ENV_MINIFY_VARS: &str = "STATESYNC_MINIFY_VARS";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinifyMode {
    Enabled,
    #[default]
    Disabled,
}

impl MinifyMode {
    pub fn is_enabled(self) -> bool {
        self == MinifyMode::Enabled
    }
}

impl FromStr for MinifyMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "true" | "1" => Ok(MinifyMode::Enabled),
            "disabled" | "false" | "0" | "" => Ok(MinifyMode::Disabled),
            other => Err(SyncError::ConfigValidation(format!("invalid minify mode {other:?}"))),
        }
    }
}

/// The three independent minification switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinifyToggles {
    pub states: MinifyMode,
    pub events: MinifyMode,
    pub vars: MinifyMode,
}

impl MinifyToggles {
    pub fn any_enabled(&self) -> bool {
        self.states.is_enabled() || self.events.is_enabled() || self.vars.is_enabled()
    }
}

/// Process-scoped cache of the loaded identifier table.
///
/// The table is read at most once until [`MinifyCache::clear`] is called.
pub struct MinifyCache {
    path: PathBuf,
    loaded: Mutex<Option<Option<Arc<MinifyConfig>>>>,
}

impl MinifyCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The table, loading it on first use. `None` when no file exists.
    pub fn get(&self) -> Result<Option<Arc<MinifyConfig>>> {
        let mut loaded = self.loaded.lock();
        if let Some(config) = loaded.as_ref() {
            return Ok(config.clone());
        }
        let config = MinifyConfig::load(&self.path)?.map(Arc::new);
        if config.is_some() {
            tracing::debug!(path = %self.path.display(), "loaded minify config");
        }
        *loaded = Some(config.clone());
        Ok(config)
    }

    /// Forget the cached table; the next [`MinifyCache::get`] reads the file again.
    pub fn clear(&self) {
        *self.loaded.lock() = None;
    }
}
