//! The `minify.json` identifier table: load, save, generate, sync, validate.

use super::compact::{compact_to_int, int_to_compact};
use crate::error::{Result, SyncError};
use crate::state::StateRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Current `minify.json` schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Default file name of the identifier table.
pub const MINIFY_JSON: &str = "minify.json";

/// Persisted identifier assignments, keyed by declared state path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinifyConfig {
    pub version: u32,
    /// State path -> state id.
    pub states: BTreeMap<String, String>,
    /// State path -> handler name -> handler id.
    #[serde(default)]
    pub events: BTreeMap<String, BTreeMap<String, String>>,
    /// State path -> field name -> field id.
    #[serde(default)]
    pub vars: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for MinifyConfig {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            states: BTreeMap::new(),
            events: BTreeMap::new(),
            vars: BTreeMap::new(),
        }
    }
}

/// Outcome of [`MinifyConfig::validate`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationReport {
    /// Problems that make the table unusable (duplicate or malformed ids).
    pub errors: Vec<String>,
    /// Entries that no longer match anything in the tree.
    pub warnings: Vec<String>,
    /// Tree entities without an id, as `state:<path>`, `event:<path>.<handler>`
    /// or `var:<path>.<field>`.
    pub missing: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl MinifyConfig {
    /// Load the table at `path`. A missing file means minification is off.
    pub fn load(path: &Path) -> Result<Option<MinifyConfig>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| SyncError::ConfigValidation(format!("{}: {e}", path.display())))?;
        Self::from_json(raw).map(Some)
    }

    /// Build from parsed JSON, checking the schema version and shape.
    pub fn from_json(raw: serde_json::Value) -> Result<MinifyConfig> {
        let version = raw.get("version").and_then(|v| v.as_u64());
        if version != Some(u64::from(SCHEMA_VERSION)) {
            return Err(SyncError::ConfigValidation(format!(
                "Unsupported minify config version {}, expected {SCHEMA_VERSION}",
                raw.get("version").map(|v| v.to_string()).unwrap_or_else(|| "none".into())
            )));
        }
        let states_ok = raw
            .get("states")
            .and_then(|s| s.as_object())
            .is_some_and(|s| s.values().all(|id| id.is_string()));
        if !states_ok {
            return Err(SyncError::ConfigValidation(
                "'states' must be a mapping of state path to id".into(),
            ));
        }
        serde_json::from_value(raw).map_err(|e| SyncError::ConfigValidation(e.to_string()))
    }

    /// Write the table as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        fs::write(path, text)?;
        Ok(())
    }

    /// Assign fresh ids to every state, handler and UI-visible field.
    ///
    /// States are numbered per sibling scope in registration order; handlers
    /// and fields per state in name order.
    pub fn generate(registry: &StateRegistry) -> MinifyConfig {
        let mut config = MinifyConfig::default();
        for (index, ty) in registry.types().iter().enumerate() {
            let position = match ty.parent {
                Some(parent) => registry.get(parent).children.iter().position(|&c| c == index),
                None => Some(0),
            };
            config
                .states
                .insert(ty.path.clone(), int_to_compact(position.unwrap_or(0) as u64));
            config.events.insert(
                ty.path.clone(),
                ty.handlers
                    .keys()
                    .enumerate()
                    .map(|(i, name)| (name.clone(), int_to_compact(i as u64)))
                    .collect(),
            );
            config.vars.insert(
                ty.path.clone(),
                frontend_fields(registry, index)
                    .into_iter()
                    .enumerate()
                    .map(|(i, name)| (name, int_to_compact(i as u64)))
                    .collect(),
            );
        }
        config
    }

    /// Add ids for entities of `registry` that the table does not know yet,
    /// keeping every existing assignment. A new id is one past the largest id
    /// already used in its sibling scope.
    pub fn sync(&self, registry: &StateRegistry) -> Result<MinifyConfig> {
        let mut config = self.clone();
        config.version = SCHEMA_VERSION;

        for (index, ty) in registry.types().iter().enumerate() {
            if !config.states.contains_key(&ty.path) {
                let scope = parent_path(&ty.path);
                let used = config
                    .states
                    .iter()
                    .filter(|(path, _)| parent_path(path) == scope)
                    .map(|(_, id)| id.as_str());
                let id = next_id(used)?;
                config.states.insert(ty.path.clone(), id);
            }

            let events = config.events.entry(ty.path.clone()).or_default();
            for name in ty.handlers.keys() {
                if !events.contains_key(name) {
                    let id = next_id(events.values().map(String::as_str))?;
                    events.insert(name.clone(), id);
                }
            }

            let vars = config.vars.entry(ty.path.clone()).or_default();
            for name in frontend_fields(registry, index) {
                if !vars.contains_key(&name) {
                    let id = next_id(vars.values().map(String::as_str))?;
                    vars.insert(name, id);
                }
            }
        }
        Ok(config)
    }

    /// Check the table against `registry`.
    pub fn validate(&self, registry: &StateRegistry) -> ValidationReport {
        let mut report = ValidationReport::default();
        if self.version != SCHEMA_VERSION {
            report.errors.push(format!(
                "Unsupported minify config version {}, expected {SCHEMA_VERSION}",
                self.version
            ));
        }

        // Duplicate state ids among siblings.
        let mut scopes: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
        for (path, id) in &self.states {
            if compact_to_int(id).is_err() {
                report.errors.push(format!("Invalid state_id={id:?} for {path}"));
            }
            let seen = scopes.entry(parent_path(path)).or_default();
            if let Some(other) = seen.insert(id.as_str(), path.as_str()) {
                report.errors.push(format!(
                    "Duplicate state_id='{id}' for {path} and {other}"
                ));
            }
        }
        for (state, ids) in &self.events {
            check_scope(&mut report, "event_id", state, ids);
        }
        for (state, ids) in &self.vars {
            check_scope(&mut report, "var_id", state, ids);
        }

        // Coverage in both directions.
        let mut known_states = BTreeSet::new();
        for (index, ty) in registry.types().iter().enumerate() {
            known_states.insert(ty.path.as_str());
            if !self.states.contains_key(&ty.path) {
                report.missing.push(format!("state:{}", ty.path));
            }
            let events = self.events.get(&ty.path);
            for name in ty.handlers.keys() {
                if !events.is_some_and(|e| e.contains_key(name)) {
                    report.missing.push(format!("event:{}.{name}", ty.path));
                }
            }
            if let Some(events) = events {
                for name in events.keys().filter(|n| !ty.handlers.contains_key(*n)) {
                    report.warnings.push(format!("Unknown event {}.{name} in minify config", ty.path));
                }
            }
            let fields = frontend_fields(registry, index);
            let vars = self.vars.get(&ty.path);
            for name in &fields {
                if !vars.is_some_and(|v| v.contains_key(name)) {
                    report.missing.push(format!("var:{}.{name}", ty.path));
                }
            }
            if let Some(vars) = vars {
                for name in vars.keys().filter(|n| !fields.contains(*n)) {
                    report.warnings.push(format!("Unknown var {}.{name} in minify config", ty.path));
                }
            }
        }
        for path in self
            .states
            .keys()
            .chain(self.events.keys())
            .chain(self.vars.keys())
            .filter(|p| !known_states.contains(p.as_str()))
            .collect::<BTreeSet<_>>()
        {
            report.warnings.push(format!("Unknown state {path} in minify config"));
        }
        report
    }
}

fn check_scope(report: &mut ValidationReport, kind: &str, state: &str, ids: &BTreeMap<String, String>) {
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
    for (name, id) in ids {
        if compact_to_int(id).is_err() {
            report.errors.push(format!("Invalid {kind}={id:?} for {state}.{name}"));
        }
        if let Some(other) = seen.insert(id.as_str(), name.as_str()) {
            report.errors.push(format!(
                "Duplicate {kind}='{id}' in {state} for {name} and {other}"
            ));
        }
    }
}

/// Path of the parent scope; the root's scope is the empty string.
fn parent_path(path: &str) -> &str {
    path.rsplit_once('.').map(|(parent, _)| parent).unwrap_or("")
}

fn next_id<'a>(used: impl Iterator<Item = &'a str>) -> Result<String> {
    let mut max: Option<u64> = None;
    for id in used {
        let n = compact_to_int(id)?;
        max = Some(max.map_or(n, |m| m.max(n)));
    }
    Ok(int_to_compact(max.map_or(0, |m| m + 1)))
}

/// Names of a type's fields sent to the UI (declared and computed), sorted.
pub(crate) fn frontend_fields(registry: &StateRegistry, index: usize) -> Vec<String> {
    let ty = registry.get(index);
    let mut names: Vec<String> = ty
        .fields
        .iter()
        .filter(|f| !f.backend)
        .map(|f| f.name.clone())
        .chain(ty.computed.iter().map(|c| c.name.clone()))
        .collect();
    names.sort();
    names
}
