//! Identifier table generation, sync and resolution through compacted ids.

use proptest::prelude::*;
use serde_json::json;
use statesync::{
    compact_to_int, int_to_compact, App, AppConfig, Event, HandlerOutput, MinifyConfig, MinifyMode,
    MinifyToggles, ResolutionPolicy, Schema, StateRegistry, StateTree, StateType, SyncError,
    UpdateStream,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tempfile::TempDir;

fn noop() -> impl Fn(&mut statesync::HandlerContext, &statesync::Args) -> Result<HandlerOutput, statesync::HandlerError>
       + Send
       + Sync
       + 'static {
    |_, _| Ok(HandlerOutput::None)
}

#[test]
fn test_sync_adds_new_state_and_handler() {
    let mut registry = StateRegistry::new(StateType::new("state")).unwrap();
    registry
        .register("state", StateType::new("fresh").handler("h", &[], noop()))
        .unwrap();

    let empty: MinifyConfig = serde_json::from_value(json!({"version": 2, "states": {}, "events": {}})).unwrap();
    let synced = empty.sync(&registry).unwrap();

    assert!(synced.states.contains_key("state"));
    assert!(synced.states.contains_key("state.fresh"));
    let events = &synced.events["state.fresh"];
    assert!(events.contains_key("h"));
    assert!(synced.validate(&registry).is_ok());
    assert!(synced.validate(&registry).missing.is_empty());
}

#[test]
fn test_sync_preserves_existing_ids() {
    let mut registry = StateRegistry::new(StateType::new("state")).unwrap();
    registry
        .register("state", StateType::new("old").field("x", 0).handler("go", &[], noop()))
        .unwrap();
    let original = MinifyConfig::generate(&registry);

    registry
        .register("state", StateType::new("new").handler("go", &[], noop()))
        .unwrap();
    let mut with_gap = original.clone();
    with_gap.states.insert("state.old".into(), "d".into());

    let synced = with_gap.sync(&registry).unwrap();
    assert_eq!(synced.states["state.old"], "d");
    assert_eq!(synced.states["state"], original.states["state"]);
    assert_eq!(synced.events["state.old"], original.events["state.old"]);
    // One past the largest id in the sibling scope.
    assert_eq!(synced.states["state.new"], "e");
}

#[test]
fn test_save_load_roundtrip_and_sync_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("minify.json");
    let mut registry = StateRegistry::new(StateType::new("state").field("user", "")).unwrap();
    registry
        .register("state", StateType::new("todo").field("items", 0).handler("add", &[], noop()))
        .unwrap();

    let generated = MinifyConfig::generate(&registry);
    generated.save(&path).unwrap();
    let loaded = MinifyConfig::load(&path).unwrap().unwrap();
    assert_eq!(loaded, generated);
    assert_eq!(loaded.sync(&registry).unwrap(), loaded);
}

fn nested_registry() -> StateRegistry {
    let mut registry = StateRegistry::new(StateType::new("a")).unwrap();
    registry
        .register("a", StateType::new("b").field("level", "child").handler("ping", &[], noop()))
        .unwrap();
    registry
        .register(
            "a.b",
            StateType::new("c").field("depth", 2).handler("ping", &[], |ctx, _| {
                ctx.set("depth", 3)?;
                Ok(HandlerOutput::None)
            }),
        )
        .unwrap();
    registry
}

fn colliding_table() -> MinifyConfig {
    let mut table = MinifyConfig::default();
    table.states = BTreeMap::from([
        ("a".to_string(), "a".to_string()),
        ("a.b".to_string(), "b".to_string()),
        ("a.b.c".to_string(), "b".to_string()),
    ]);
    table
}

#[test]
fn test_parent_child_collision_resolves_full_path() {
    let registry = nested_registry();
    let table = colliding_table();
    // Same id for parent and child is not a sibling duplicate.
    assert!(table.validate(&registry).is_ok());

    for policy in [ResolutionPolicy::Backtrack, ResolutionPolicy::Strict] {
        let toggles = MinifyToggles {
            states: MinifyMode::Enabled,
            ..MinifyToggles::default()
        };
        let schema = Schema::new(Arc::new(registry.clone()), Some(&table), toggles).with_policy(policy);
        let tree = StateTree::new(Arc::new(schema));
        assert_eq!(tree.get_substate(&["a", "b", "b"]).unwrap().path(), "a.b.c");
        assert_eq!(tree.get_substate(&["a", "b"]).unwrap().path(), "a.b");
        let (node, _) = tree.resolve_handler("a.b.b.ping").unwrap();
        assert_eq!(node.path(), "a.b.c");
    }
}

#[test]
fn test_events_through_minified_app() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("minify.json");
    colliding_table().sync(&nested_registry()).unwrap().save(&path).unwrap();

    let app = App::builder()
        .config(AppConfig {
            minify_path: path,
            minify_states: MinifyMode::Enabled,
            ..AppConfig::default()
        })
        .state(nested_registry())
        .build()
        .unwrap();
    let stream = UpdateStream::new();
    app.process(Event::new("t", "a.b.b.ping"), &stream.sender()).unwrap();
    let update = stream.drain().pop().unwrap();
    assert_eq!(update.delta["a.b.b"]["depth"], json!(3));
}

#[test]
fn test_sibling_collision_under_both_policies() {
    let mut registry = StateRegistry::new(StateType::new("root")).unwrap();
    registry.register("root", StateType::new("left")).unwrap();
    registry.register("root", StateType::new("right")).unwrap();
    registry
        .register("root.right", StateType::new("leaf").field("v", 1))
        .unwrap();
    let mut table = MinifyConfig::default();
    table.states = BTreeMap::from([
        ("root".to_string(), "a".to_string()),
        ("root.left".to_string(), "x".to_string()),
        ("root.right".to_string(), "x".to_string()),
        ("root.right.leaf".to_string(), "a".to_string()),
    ]);
    assert!(!table.validate(&registry).is_ok());

    let toggles = MinifyToggles {
        states: MinifyMode::Enabled,
        ..MinifyToggles::default()
    };
    let backtrack = Schema::new(Arc::new(registry.clone()), Some(&table), toggles);
    let tree = StateTree::new(Arc::new(backtrack));
    assert_eq!(tree.get_substate(&["a", "x", "a"]).unwrap().path(), "root.right.leaf");

    let strict = Schema::new(Arc::new(registry), Some(&table), toggles).with_policy(ResolutionPolicy::Strict);
    let tree = StateTree::new(Arc::new(strict));
    assert!(matches!(tree.get_substate(&["a", "x", "a"]), Err(SyncError::StateResolution(_))));
}

proptest! {
    #[test]
    fn prop_compact_roundtrip(n in any::<u64>()) {
        prop_assert_eq!(compact_to_int(&int_to_compact(n)).unwrap(), n);
    }

    #[test]
    fn prop_contiguous_range_distinct(start in 0u64..1_000_000, len in 1usize..500) {
        let ids: HashSet<String> = (start..start + len as u64).map(int_to_compact).collect();
        prop_assert_eq!(ids.len(), len);
    }
}
