//! Performance benchmarks for the sync engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use statesync::{
    collect_delta, int_to_compact, App, AppConfig, Event, HandlerOutput, Schema, StateManagerMode,
    StateRegistry, StateTree, StateType, UpdateStream, Value,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Root with `width` children, each holding a counter and a list of `items` strings.
fn wide_registry(width: usize, items: usize) -> StateRegistry {
    let mut registry = StateRegistry::new(StateType::new("state")).unwrap();
    for i in 0..width {
        let list = Value::list((0..items).map(|n| Value::from(format!("item {n}"))));
        registry
            .register(
                "state",
                StateType::new(format!("child{i}"))
                    .field("counter", 0)
                    .field("items", list)
                    .handler("bump", &[], |ctx, _| {
                        let current = ctx.get("counter")?.as_int().unwrap_or(0);
                        ctx.set("counter", current + 1)?;
                        Ok(HandlerOutput::None)
                    }),
            )
            .unwrap();
    }
    registry
}

fn tree(width: usize, items: usize) -> StateTree {
    StateTree::new(Arc::new(Schema::plain(Arc::new(wide_registry(width, items)))))
}

/// Delta collection when one node in a wide tree is dirty
fn bench_collect_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect_delta");

    for width in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("children", width), &width, |b, &width| {
            let tree = tree(width, 4);
            let target = tree.substate("state.child0").unwrap();
            let mut n = 0i64;
            b.iter(|| {
                n += 1;
                target.set("counter", n).unwrap();
                black_box(collect_delta(&tree).unwrap());
            });
        });
    }

    group.finish();
}

/// Tree persistence with growing field payloads
fn bench_tree_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_bytes");

    for items in [10, 100, 1000] {
        let tree = tree(10, items);
        let bytes = tree.to_bytes().unwrap();

        group.bench_with_input(BenchmarkId::new("encode", items), &items, |b, _| {
            b.iter(|| black_box(tree.to_bytes().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", items), &items, |b, _| {
            b.iter(|| black_box(StateTree::from_bytes(Arc::clone(tree.schema()), &bytes).unwrap()));
        });
    }

    group.finish();
}

/// Full event round trip through each backend
fn bench_process_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_event");

    for mode in [StateManagerMode::Memory, StateManagerMode::Disk, StateManagerMode::Cache] {
        let dir = TempDir::new().unwrap();
        let app = App::builder()
            .config(AppConfig {
                state_manager_mode: mode,
                state_dir: dir.path().join("states"),
                ..AppConfig::default()
            })
            .state(wide_registry(10, 10))
            .build()
            .unwrap();
        let stream = UpdateStream::new();
        let sender = stream.sender();

        group.bench_function(BenchmarkId::new("mode", format!("{mode:?}")), |b| {
            b.iter(|| {
                app.process(Event::new("bench", "state.child3.bump"), &sender)
                    .unwrap();
                black_box(stream.drain());
            });
        });
    }

    group.finish();
}

/// Event with arguments through the auto setter
fn bench_setvar(c: &mut Criterion) {
    let app = App::builder().state(wide_registry(1, 0)).build().unwrap();
    let stream = UpdateStream::new();
    let sender = stream.sender();

    c.bench_function("setvar", |b| {
        b.iter(|| {
            let event = Event::new("bench", "state.child0.setvar")
                .with_arg("var", json!("counter"))
                .with_arg("value", json!(7));
            app.process(event, &sender).unwrap();
            black_box(stream.drain());
        });
    });
}

/// Identifier encoding
fn bench_int_to_compact(c: &mut Criterion) {
    c.bench_function("int_to_compact_10k", |b| {
        b.iter(|| {
            for n in 0..10_000u64 {
                black_box(int_to_compact(black_box(n)));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_collect_delta,
    bench_tree_bytes,
    bench_process_event,
    bench_setvar,
    bench_int_to_compact,
);

criterion_main!(benches);
