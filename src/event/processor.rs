//! Event processing: resolve, invoke, flush, commit.

use crate::delta::collect_delta;
use crate::error::{Result, SyncError};
use crate::event::exception::{ExceptionDomain, ExceptionHandler};
use crate::event::{Args, BackgroundContext, HandlerContext, HandlerError, HandlerOutput};
use crate::manager::StateManager;
use crate::state::{HandlerDef, HandlerKind, StateNode, StateTree, ROUTER_FIELD};
use crate::types::{Delta, Event, EventSpec, StateUpdate, UpdateSender, FRONTEND_EXCEPTION_EVENT};
use crate::value::Value;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Runs events against the trees of a [`StateManager`].
///
/// Per event: `Received -> Resolved -> Invoking -> Succeeded | Failed ->
/// Flushed`. Handler failures never escape `process`; they go to the backend
/// exception callback. Only resolution, lease and storage errors are returned.
pub struct EventProcessor {
    manager: Arc<dyn StateManager>,
    frontend: ExceptionHandler,
    backend: ExceptionHandler,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl EventProcessor {
    /// Build a processor, rejecting invalid exception callbacks.
    pub fn new(
        manager: Arc<dyn StateManager>,
        frontend: ExceptionHandler,
        backend: ExceptionHandler,
    ) -> Result<Self> {
        frontend.validate(ExceptionDomain::Frontend)?;
        backend.validate(ExceptionDomain::Backend)?;
        Ok(Self {
            manager,
            frontend,
            backend,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Processor with the logging exception callbacks.
    pub fn with_defaults(manager: Arc<dyn StateManager>) -> Self {
        Self {
            manager,
            frontend: ExceptionHandler::default_frontend(),
            backend: ExceptionHandler::default_backend(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &Arc<dyn StateManager> {
        &self.manager
    }

    /// Process one event, sending partial and final updates to `updates`.
    pub fn process(&self, event: Event, updates: &UpdateSender) -> Result<()> {
        tracing::debug!(token = %event.token, handler = %event.handler_path, "event received");

        if event.handler_path == FRONTEND_EXCEPTION_EVENT {
            let message = payload_str(&event, "message");
            let stack = payload_str(&event, "stack");
            let events = self.frontend.call(&message, &stack);
            send(updates, StateUpdate {
                delta: Default::default(),
                events,
                is_final: true,
            });
            return Ok(());
        }

        let lease = self.manager.modify(&event.token)?;
        let tree = lease.tree().clone();
        apply_router(&tree, &event)?;

        let (node, handler) = tree.resolve_handler(&event.handler_path)?;
        tracing::debug!(token = %event.token, node = %node.path(), handler = %handler.name, "event resolved");

        let (mut events, background) = match &handler.kind {
            HandlerKind::Foreground(_) => {
                let mut ctx = HandlerContext::new(event.token.as_str(), tree.clone(), Arc::clone(&node));
                (self.run_foreground(&handler, &mut ctx, &event, updates), None)
            }
            HandlerKind::Background(_) => (Vec::new(), Some(handler.clone())),
        };

        let delta = match self.flush(&tree, &handler.name) {
            Ok(delta) => delta,
            Err(reported) => {
                events.extend(reported);
                Delta::new()
            }
        };
        lease.commit()?;
        tracing::debug!(token = %event.token, nodes = delta.len(), events = events.len(), "event flushed");
        send(updates, StateUpdate {
            delta,
            events,
            is_final: true,
        });

        if let Some(handler) = background {
            self.spawn_background(&event, &node, handler, updates)?;
        }
        Ok(())
    }

    /// Invoke a foreground handler, flushing a partial update after every
    /// progress step. Returns the follow-up events for the final update.
    fn run_foreground(
        &self,
        handler: &HandlerDef,
        ctx: &mut HandlerContext,
        event: &Event,
        updates: &UpdateSender,
    ) -> Vec<EventSpec> {
        tracing::debug!(handler = %handler.name, "invoking handler");
        let output = match invoke(handler, ctx, &event.payload) {
            Ok(output) => output,
            Err(err) => return self.report(&handler.name, &err),
        };
        match output {
            HandlerOutput::None => Vec::new(),
            HandlerOutput::Event(event) => vec![event],
            HandlerOutput::Events(events) => events,
            HandlerOutput::Steps(mut steps) => loop {
                let step = catch_unwind(AssertUnwindSafe(|| steps.next_step(ctx)))
                    .unwrap_or_else(|panic| Some(Err(HandlerError::from_panic(panic))));
                match step {
                    None => break Vec::new(),
                    Some(Ok(events)) => {
                        // A failed flush ends the handler like a failed step.
                        let delta = match self.flush(ctx.tree(), &handler.name) {
                            Ok(delta) => delta,
                            Err(reported) => break reported,
                        };
                        tracing::debug!(handler = %handler.name, nodes = delta.len(), "partial flush");
                        send(updates, StateUpdate {
                            delta,
                            events,
                            is_final: false,
                        });
                    }
                    Some(Err(err)) => break self.report(&handler.name, &err),
                }
            },
        }
    }

    /// Collect the delta of `tree`. Computed fields run user code, so a
    /// failure or panic here is reported like a handler failure: the tree is
    /// cleaned and the callback's events are returned as the error.
    fn flush(&self, tree: &StateTree, handler: &str) -> std::result::Result<Delta, Vec<EventSpec>> {
        let collected = catch_unwind(AssertUnwindSafe(|| collect_delta(tree)))
            .map_err(HandlerError::from_panic)
            .and_then(|delta| delta.map_err(HandlerError::from));
        collected.map_err(|err| {
            tree.root().clean();
            self.report(handler, &err)
        })
    }

    /// Route a handler failure to the backend callback.
    fn report(&self, handler: &str, err: &HandlerError) -> Vec<EventSpec> {
        let error = SyncError::HandlerInvocation {
            handler: handler.to_string(),
            message: err.message.clone(),
        };
        tracing::debug!(%error, "handler failed");
        self.backend.call(&err.message, &err.stack)
    }

    fn spawn_background(
        &self,
        event: &Event,
        node: &StateNode,
        handler: HandlerDef,
        updates: &UpdateSender,
    ) -> Result<()> {
        let HandlerKind::Background(body) = handler.kind else {
            return Ok(());
        };
        let ctx = BackgroundContext::new(
            event.token.as_str(),
            node.path(),
            Arc::clone(&self.manager),
            updates.clone(),
        )?;
        let backend = self.backend.clone();
        let name = handler.name;
        let params = handler.params;
        let payload = event.payload.clone();

        let join = thread::Builder::new()
            .name(format!("statesync-bg-{name}"))
            .spawn(move || {
                tracing::debug!(token = %ctx.token(), handler = %name, "background handler started");
                let result = Args::bind(&name, &params, &payload).and_then(|args| {
                    catch_unwind(AssertUnwindSafe(|| body(&ctx, &args)))
                        .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic)))
                });
                if let Err(err) = result {
                    let error = SyncError::HandlerInvocation {
                        handler: name.clone(),
                        message: err.message.clone(),
                    };
                    tracing::debug!(%error, "background handler failed");
                    ctx.emit(backend.call(&err.message, &err.stack));
                }
                tracing::debug!(token = %ctx.token(), handler = %name, "background handler finished");
            })?;

        let mut background = self.background.lock();
        background.retain(|handle| !handle.is_finished());
        background.push(join);
        Ok(())
    }

    /// Block until every background handler started so far has finished.
    pub fn wait_for_background(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if handle.join().is_err() {
                    tracing::warn!("background handler thread panicked");
                }
            }
        }
    }
}

/// Bind arguments and call a foreground handler, turning panics into
/// handler errors.
pub(crate) fn invoke(
    handler: &HandlerDef,
    ctx: &mut HandlerContext,
    payload: &crate::types::Payload,
) -> std::result::Result<HandlerOutput, HandlerError> {
    let HandlerKind::Foreground(body) = &handler.kind else {
        return Err(HandlerError::new(format!(
            "{} is a background handler",
            handler.name
        )));
    };
    let args = Args::bind(&handler.name, &handler.params, payload)?;
    catch_unwind(AssertUnwindSafe(|| body(ctx, &args))).unwrap_or_else(|panic| Err(HandlerError::from_panic(panic)))
}

/// Drive a handler to completion without flushing; progress steps are run
/// back to back. Used where no update stream exists, such as snapshots.
pub(crate) fn run_to_completion(
    handler: &HandlerDef,
    ctx: &mut HandlerContext,
    payload: &crate::types::Payload,
) -> std::result::Result<Vec<EventSpec>, HandlerError> {
    match invoke(handler, ctx, payload)? {
        HandlerOutput::None => Ok(Vec::new()),
        HandlerOutput::Event(event) => Ok(vec![event]),
        HandlerOutput::Events(events) => Ok(events),
        HandlerOutput::Steps(mut steps) => {
            let mut events = Vec::new();
            loop {
                let step = catch_unwind(AssertUnwindSafe(|| steps.next_step(ctx)))
                    .unwrap_or_else(|panic| Some(Err(HandlerError::from_panic(panic))));
                match step {
                    None => return Ok(events),
                    Some(Ok(more)) => events.extend(more),
                    Some(Err(err)) => return Err(err),
                }
            }
        }
    }
}

/// Write the event's router context into the root `router` field, marking
/// it dirty only when it changed.
fn apply_router(tree: &StateTree, event: &Event) -> Result<()> {
    if event.router_context.is_empty() {
        return Ok(());
    }
    let router = Value::from_json(&serde_json::Value::Object(event.router_context.clone()));
    let root = tree.root();
    if root.get(ROUTER_FIELD)? != router {
        root.set(ROUTER_FIELD, router)?;
    }
    Ok(())
}

fn payload_str(event: &Event, key: &str) -> String {
    match event.payload.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn send(updates: &UpdateSender, update: StateUpdate) {
    if updates.send(update).is_err() {
        tracing::debug!("update receiver dropped");
    }
}
