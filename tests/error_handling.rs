//! Error handling and edge case tests.

use parking_lot::Mutex;
use serde_json::json;
use statesync::{
    App, AppConfig, Event, EventSpec, ExceptionHandler, HandlerError, HandlerOutput, MinifyConfig,
    MinifyMode, ParamType, ReturnKind, StateRegistry, StateType, SyncError, UpdateStream, Value,
    FRONTEND_EXCEPTION_EVENT,
};
use std::sync::Arc;
use tempfile::TempDir;

fn registry() -> StateRegistry {
    let mut registry = StateRegistry::new(StateType::new("state").field("count", 0)).unwrap();
    registry
        .register(
            "state",
            StateType::new("form")
                .field("name", "")
                .computed("greeting", &["name"], |node| {
                    Ok(Value::from(format!("hi {}", node.get("name")?.as_str().unwrap_or(""))))
                })
                .handler("submit", &["name"], |ctx, args| {
                    ctx.set("name", args.str("name")?)?;
                    Ok(HandlerOutput::None)
                })
                .handler("crash", &[], |_, _| {
                    let values: Vec<i64> = Vec::new();
                    Ok(EventSpec::new(format!("state.form.{}", values[3])).into())
                })
                .handler("write_computed", &[], |ctx, _| {
                    ctx.set("greeting", "nope")?;
                    Ok(HandlerOutput::None)
                }),
        )
        .unwrap();
    registry
}

fn collecting_backend() -> (ExceptionHandler, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = ExceptionHandler::function("collect_errors", move |message, _stack| {
        sink.lock().push(message.to_string());
        vec![EventSpec::new("_toast").with_arg("message", json!(message))]
    });
    (handler, seen)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// --- Handler Failures ---

#[test]
fn test_panicking_handler_keeps_session_usable() {
    init_tracing();
    let (backend, seen) = collecting_backend();
    let app = App::builder()
        .state(registry())
        .backend_exception_handler(backend)
        .build()
        .unwrap();
    let stream = UpdateStream::new();
    let sender = stream.sender();

    app.process(Event::new("t", "state.form.crash"), &sender).unwrap();
    let update = stream.drain().pop().unwrap();
    assert!(update.is_final);
    assert_eq!(update.events[0].handler_path, "_toast");
    assert_eq!(seen.lock().len(), 1);
    assert!(seen.lock()[0].contains("index out of bounds"));

    app.process(Event::new("t", "state.form.submit").with_arg("name", json!("ann")), &sender)
        .unwrap();
    let update = stream.drain().pop().unwrap();
    assert_eq!(update.delta["state.form"]["greeting"], json!("hi ann"));
}

#[test]
fn test_panicking_exception_callback_is_contained() {
    init_tracing();
    let backend = ExceptionHandler::function("flaky_reporter", |message, _| {
        panic!("reporter failed on {message}");
    });
    let app = App::builder()
        .state(registry())
        .backend_exception_handler(backend)
        .build()
        .unwrap();
    let stream = UpdateStream::new();
    let sender = stream.sender();

    app.process(Event::new("t", "state.form.crash"), &sender).unwrap();
    let update = stream.drain().pop().unwrap();
    assert!(update.is_final);
    assert!(update.events.is_empty());

    // The lease was released and the token still accepts events.
    app.process(Event::new("t", "state.form.submit").with_arg("name", json!("bo")), &sender)
        .unwrap();
    assert_eq!(stream.drain().pop().unwrap().delta["state.form"]["greeting"], json!("hi bo"));
}

#[test]
fn test_failing_computed_field_routed_to_backend() {
    let (backend, seen) = collecting_backend();
    let mut registry = StateRegistry::new(StateType::new("state")).unwrap();
    registry
        .register(
            "state",
            StateType::new("stats")
                .field("total", 0)
                .field("count", 0)
                .computed("average", &["total", "count"], |node| {
                    let total = node.get("total")?.as_int().unwrap_or(0);
                    match node.get("count")?.as_int().unwrap_or(0) {
                        0 => Err(SyncError::InvalidOperation("average of nothing".into())),
                        count => Ok(Value::from(total / count)),
                    }
                }),
        )
        .unwrap();
    let app = App::builder()
        .state(registry)
        .backend_exception_handler(backend)
        .build()
        .unwrap();
    let stream = UpdateStream::new();
    let sender = stream.sender();

    app.process(Event::new("t", "state.stats.set_total").with_arg("value", json!(10)), &sender)
        .unwrap();
    let update = stream.drain().pop().unwrap();
    assert!(update.is_final);
    assert_eq!(update.events[0].handler_path, "_toast");
    assert!(seen.lock()[0].contains("average of nothing"));

    // The write was kept.
    let tree = app.get_state("t").unwrap();
    assert_eq!(tree.substate("state.stats").unwrap().get("total").unwrap().as_int(), Some(10));

    app.process(Event::new("t", "state.stats.set_count").with_arg("value", json!(2)), &sender)
        .unwrap();
    assert_eq!(stream.drain().pop().unwrap().delta["state.stats"]["average"], json!(5));
}

#[test]
fn test_writing_computed_field_is_handler_failure() {
    let (backend, seen) = collecting_backend();
    let app = App::builder()
        .state(registry())
        .backend_exception_handler(backend)
        .build()
        .unwrap();
    let stream = UpdateStream::new();
    app.process(Event::new("t", "state.form.write_computed"), &stream.sender())
        .unwrap();
    assert!(seen.lock()[0].contains("Invalid operation"));
}

#[test]
fn test_setvar_rejects_unknown_var() {
    let (backend, seen) = collecting_backend();
    let app = App::builder()
        .state(registry())
        .backend_exception_handler(backend)
        .build()
        .unwrap();
    let stream = UpdateStream::new();
    app.process(
        Event::new("t", "state.form.setvar")
            .with_arg("var", json!("greeting"))
            .with_arg("value", json!("x")),
        &stream.sender(),
    )
    .unwrap();
    assert!(seen.lock()[0].contains("Invalid var passed to setvar"));
}

// --- Protocol Errors ---

#[test]
fn test_unresolved_handler_is_protocol_error() {
    let app = App::builder().state(registry()).build().unwrap();
    let stream = UpdateStream::new();
    for path in ["state.form.missing", "state.nowhere.submit", "other.form.submit", ""] {
        let err = app.process(Event::new("t", path), &stream.sender()).unwrap_err();
        assert!(matches!(err, SyncError::StateResolution(_)), "{path}: {err}");
        assert!(err.is_recoverable());
    }
    assert!(stream.drain().is_empty());
}

#[test]
fn test_frontend_exception_routed() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let frontend = ExceptionHandler::method("report", move |message, stack| {
        sink.lock().push(format!("{message}|{stack}"));
        Vec::new()
    });
    let app = App::builder()
        .state(registry())
        .frontend_exception_handler(frontend)
        .build()
        .unwrap();
    let stream = UpdateStream::new();
    app.process(
        Event::new("t", FRONTEND_EXCEPTION_EVENT)
            .with_arg("message", json!("ReferenceError: x"))
            .with_arg("stack", json!("at App")),
        &stream.sender(),
    )
    .unwrap();
    assert_eq!(*seen.lock(), vec!["ReferenceError: x|at App".to_string()]);
}

// --- Configuration Errors ---

#[test]
fn test_exception_handler_signatures_checked_at_build() {
    let cases = [
        ExceptionHandler::partial("bound_handler", |_, _| Vec::new()),
        ExceptionHandler::closure(|_, _| Vec::new()),
        ExceptionHandler::function("no_stack", |_, _| Vec::new())
            .with_params(vec![("message".to_string(), ParamType::Str)]),
        ExceptionHandler::function("typed_wrong", |_, _| Vec::new()).with_params(vec![
            ("message".to_string(), ParamType::Str),
            ("stack".to_string(), ParamType::Other("list".into())),
        ]),
        ExceptionHandler::function("extra_arg", |_, _| Vec::new()).with_params(vec![
            ("message".to_string(), ParamType::Str),
            ("stack".to_string(), ParamType::Str),
            ("context".to_string(), ParamType::Str),
        ]),
        ExceptionHandler::function("returns_int", |_, _| Vec::new())
            .with_returns(ReturnKind::Other("int".into())),
    ];
    for handler in cases {
        let name = handler.name().to_string();
        let result = App::builder()
            .state(registry())
            .backend_exception_handler(handler)
            .build();
        match result {
            Err(SyncError::ConfigValidation(message)) => {
                assert!(message.contains(&name), "{message}");
                assert!(message.contains("backend"));
            }
            Err(other) => panic!("{name}: unexpected error {other}"),
            Ok(_) => panic!("{name}: accepted"),
        }
    }
}

#[test]
fn test_invalid_minify_config_fails_build() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("minify.json");
    std::fs::write(&path, r#"{"version": 99, "states": {}}"#).unwrap();
    let config = AppConfig {
        minify_path: path.clone(),
        minify_states: MinifyMode::Enabled,
        ..AppConfig::default()
    };
    let result = App::builder().config(config.clone()).state(registry()).build();
    assert!(matches!(result, Err(SyncError::ConfigValidation(_))));

    std::fs::write(&path, r#"{"version": 2}"#).unwrap();
    let result = App::builder().config(config.clone()).state(registry()).build();
    assert!(matches!(result, Err(SyncError::ConfigValidation(_))));

    // Two siblings sharing an id.
    let mut table = MinifyConfig::generate(&registry());
    table.states.insert("state.form".into(), "z".into());
    let mut registry = registry();
    registry.register("state", StateType::new("other")).unwrap();
    table.states.insert("state.other".into(), "z".into());
    table.save(&path).unwrap();
    let result = App::builder().config(config).state(registry).build();
    match result {
        Err(SyncError::ConfigValidation(message)) => assert!(message.contains("Duplicate")),
        _ => panic!("duplicate sibling ids accepted"),
    }
}

#[test]
fn test_minify_toggle_without_file_is_plain() {
    let dir = TempDir::new().unwrap();
    let app = App::builder()
        .config(AppConfig {
            minify_path: dir.path().join("absent.json"),
            minify_states: MinifyMode::Enabled,
            minify_events: MinifyMode::Enabled,
            ..AppConfig::default()
        })
        .state(registry())
        .build()
        .unwrap();
    let schema = app.schema().unwrap();
    assert!(!schema.states_minified());
    assert!(!schema.events_minified());
}

#[test]
fn test_zero_lock_timeout_rejected() {
    let result = App::builder()
        .config(AppConfig {
            lock_timeout_ms: 0,
            ..AppConfig::default()
        })
        .build();
    assert!(matches!(result, Err(SyncError::ConfigValidation(_))));
}

#[test]
fn test_handler_error_stack_passed_through() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let backend = ExceptionHandler::function("stacks", move |_, stack| {
        sink.lock().push(stack.to_string());
        Vec::new()
    });
    let mut registry = StateRegistry::new(StateType::new("state")).unwrap();
    registry
        .register(
            "state",
            StateType::new("job").handler("run", &[], |_, _| {
                Err(HandlerError::with_stack("failed", "job.rs:10"))
            }),
        )
        .unwrap();
    let app = App::builder()
        .state(registry)
        .backend_exception_handler(backend)
        .build()
        .unwrap();
    let stream = UpdateStream::new();
    app.process(Event::new("t", "state.job.run"), &stream.sender()).unwrap();
    assert_eq!(*seen.lock(), vec!["job.rs:10".to_string()]);
}
