//! Wire names of states, handlers and fields.

use super::config::MinifyConfig;
use super::MinifyToggles;
use crate::state::{ResolutionPolicy, StateRegistry};
use std::collections::HashMap;
use std::sync::Arc;

/// Wire names of one state type.
#[derive(Debug, Default)]
struct TypeNames {
    state_id: String,
    wire_path: String,
    field_to_wire: HashMap<String, String>,
    wire_to_field: HashMap<String, String>,
    handler_to_wire: HashMap<String, String>,
    wire_to_handler: HashMap<String, String>,
}

/// Registry plus the names everything is addressed by on the wire.
///
/// Without an identifier table (or with a toggle off) the declared names are
/// used. Names missing from the table also fall back to the declared name.
#[derive(Debug)]
pub struct Schema {
    registry: Arc<StateRegistry>,
    names: Vec<TypeNames>,
    policy: ResolutionPolicy,
    minify_states: bool,
    minify_events: bool,
    minify_vars: bool,
}

impl Schema {
    /// Schema using declared names throughout.
    pub fn plain(registry: Arc<StateRegistry>) -> Self {
        Self::new(registry, None, MinifyToggles::default())
    }

    /// Schema applying `config` for every toggle that is enabled.
    pub fn new(registry: Arc<StateRegistry>, config: Option<&MinifyConfig>, toggles: MinifyToggles) -> Self {
        let minify_states = toggles.states.is_enabled() && config.is_some();
        let minify_events = toggles.events.is_enabled() && config.is_some();
        let minify_vars = toggles.vars.is_enabled() && config.is_some();

        let mut names: Vec<TypeNames> = Vec::with_capacity(registry.len());
        for ty in registry.types() {
            let state_id = config
                .filter(|_| minify_states)
                .and_then(|c| c.states.get(&ty.path).cloned())
                .unwrap_or_else(|| ty.name.clone());
            let wire_path = match ty.parent {
                Some(parent) => format!("{}.{state_id}", names[parent].wire_path),
                None => state_id.clone(),
            };

            let mut entry = TypeNames {
                state_id,
                wire_path,
                ..TypeNames::default()
            };
            if let Some(ids) = config.filter(|_| minify_events).and_then(|c| c.events.get(&ty.path)) {
                for (handler, id) in ids.iter().filter(|(h, _)| ty.handlers.contains_key(*h)) {
                    entry.handler_to_wire.insert(handler.clone(), id.clone());
                    entry.wire_to_handler.insert(id.clone(), handler.clone());
                }
            }
            if let Some(ids) = config.filter(|_| minify_vars).and_then(|c| c.vars.get(&ty.path)) {
                for (field, id) in ids {
                    entry.field_to_wire.insert(field.clone(), id.clone());
                    entry.wire_to_field.insert(id.clone(), field.clone());
                }
            }
            names.push(entry);
        }

        Self {
            registry,
            names,
            policy: ResolutionPolicy::default(),
            minify_states,
            minify_events,
            minify_vars,
        }
    }

    pub fn with_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.registry
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    pub fn states_minified(&self) -> bool {
        self.minify_states
    }

    pub fn events_minified(&self) -> bool {
        self.minify_events
    }

    pub fn vars_minified(&self) -> bool {
        self.minify_vars
    }

    /// Sibling-scoped id of a state type.
    pub fn state_id(&self, index: usize) -> &str {
        &self.names[index].state_id
    }

    /// Dotted wire path of a state type, root first.
    pub fn wire_path(&self, index: usize) -> &str {
        &self.names[index].wire_path
    }

    pub fn field_wire<'a>(&'a self, index: usize, field: &'a str) -> &'a str {
        self.names[index]
            .field_to_wire
            .get(field)
            .map(String::as_str)
            .unwrap_or(field)
    }

    /// Declared field name for a wire name.
    pub fn field_name<'a>(&'a self, index: usize, wire: &'a str) -> &'a str {
        self.names[index]
            .wire_to_field
            .get(wire)
            .map(String::as_str)
            .unwrap_or(wire)
    }

    pub fn handler_wire<'a>(&'a self, index: usize, handler: &'a str) -> &'a str {
        self.names[index]
            .handler_to_wire
            .get(handler)
            .map(String::as_str)
            .unwrap_or(handler)
    }

    /// Declared handler name for a wire name.
    pub fn handler_name<'a>(&'a self, index: usize, wire: &'a str) -> &'a str {
        self.names[index]
            .wire_to_handler
            .get(wire)
            .map(String::as_str)
            .unwrap_or(wire)
    }

    /// Wire form of a handler path, e.g. `"a.b.c"` for `state.todo.add`.
    pub fn handler_path(&self, index: usize, handler: &str) -> String {
        format!("{}.{}", self.wire_path(index), self.handler_wire(index, handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minify::MinifyMode;
    use crate::state::StateType;

    fn registry() -> Arc<StateRegistry> {
        let mut registry = StateRegistry::new(StateType::new("state")).unwrap();
        registry
            .register("state", StateType::new("todo").field("items", crate::value::Value::list([])))
            .unwrap();
        Arc::new(registry)
    }

    fn all_enabled() -> MinifyToggles {
        MinifyToggles {
            states: MinifyMode::Enabled,
            events: MinifyMode::Enabled,
            vars: MinifyMode::Enabled,
        }
    }

    #[test]
    fn test_plain_names() {
        let schema = Schema::plain(registry());
        assert_eq!(schema.wire_path(1), "state.todo");
        assert_eq!(schema.field_wire(1, "items"), "items");
        assert_eq!(schema.handler_path(1, "set_items"), "state.todo.set_items");
    }

    #[test]
    fn test_toggle_without_config_uses_names() {
        let schema = Schema::new(registry(), None, all_enabled());
        assert!(!schema.states_minified());
        assert_eq!(schema.wire_path(1), "state.todo");
    }

    #[test]
    fn test_config_without_toggle_uses_names() {
        let config = MinifyConfig::generate(&registry());
        let schema = Schema::new(registry(), Some(&config), MinifyToggles::default());
        assert!(!schema.states_minified());
        assert!(!schema.events_minified());
        assert_eq!(schema.wire_path(1), "state.todo");
    }

    #[test]
    fn test_independent_toggles() {
        let registry = registry();
        let config = MinifyConfig::generate(&registry);
        let toggles = MinifyToggles {
            states: MinifyMode::Enabled,
            ..MinifyToggles::default()
        };
        let schema = Schema::new(Arc::clone(&registry), Some(&config), toggles);
        assert_eq!(schema.wire_path(1), "a.a");
        assert_eq!(schema.handler_wire(1, "set_items"), "set_items");
        assert_eq!(schema.field_wire(1, "items"), "items");
    }

    #[test]
    fn test_minified_names_both_ways() {
        let registry = registry();
        let config = MinifyConfig::generate(&registry);
        let schema = Schema::new(Arc::clone(&registry), Some(&config), all_enabled());

        let wire = schema.handler_wire(1, "set_items").to_string();
        assert_ne!(wire, "set_items");
        assert_eq!(schema.handler_name(1, &wire), "set_items");
        let field = schema.field_wire(1, "items").to_string();
        assert_eq!(schema.field_name(1, &field), "items");
        assert_eq!(schema.handler_path(1, "set_items"), format!("a.a.{wire}"));
    }
}
