//! What handler code sees: bound arguments, the context and output shapes.

use crate::error::{Result, SyncError};
use crate::proxy::{Arg, Item};
use crate::state::{StateNode, StateTree};
use crate::types::{EventSpec, Payload};
use crate::value::Value;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by handler code.
///
/// Never propagated to the transport: the processor routes it to the backend
/// exception callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Rendered stack, empty when backtraces are not enabled.
    pub stack: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        let backtrace = Backtrace::capture();
        let stack = match backtrace.status() {
            BacktraceStatus::Captured => backtrace.to_string(),
            _ => String::new(),
        };
        Self {
            message: message.into(),
            stack,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
        }
    }

    /// Error for a caught panic, carrying the panic message when it has one.
    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        HandlerError::new(message)
    }
}

impl From<SyncError> for HandlerError {
    fn from(e: SyncError) -> Self {
        HandlerError::new(e.to_string())
    }
}

/// Event payload bound to a handler's declared parameters.
#[derive(Clone, Debug, Default)]
pub struct Args {
    values: Payload,
}

impl Args {
    /// Match `payload` against `params` by name. Missing and unexpected
    /// arguments are errors.
    pub fn bind(handler: &str, params: &[String], payload: &Payload) -> std::result::Result<Args, HandlerError> {
        if let Some(missing) = params.iter().find(|p| !payload.contains_key(*p)) {
            return Err(HandlerError::new(format!(
                "{handler}() missing required argument '{missing}'"
            )));
        }
        if let Some(unexpected) = payload.keys().find(|k| !params.contains(*k)) {
            return Err(HandlerError::new(format!(
                "{handler}() got an unexpected argument '{unexpected}'"
            )));
        }
        Ok(Args {
            values: payload.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn json(&self, name: &str) -> std::result::Result<&serde_json::Value, HandlerError> {
        self.values
            .get(name)
            .ok_or_else(|| HandlerError::new(format!("no argument named '{name}'")))
    }

    /// Argument as a state value (arrays become lists, objects mappings).
    pub fn value(&self, name: &str) -> std::result::Result<Value, HandlerError> {
        self.json(name).map(Value::from_json)
    }

    /// Argument decoded into any deserializable type.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<T, HandlerError> {
        serde_json::from_value(self.json(name)?.clone())
            .map_err(|e| HandlerError::new(format!("argument '{name}': {e}")))
    }

    pub fn str(&self, name: &str) -> std::result::Result<String, HandlerError> {
        match self.json(name)? {
            serde_json::Value::String(s) => Ok(s.clone()),
            other => Err(type_error(name, "str", other)),
        }
    }

    pub fn int(&self, name: &str) -> std::result::Result<i64, HandlerError> {
        let value = self.json(name)?;
        value.as_i64().ok_or_else(|| type_error(name, "int", value))
    }

    pub fn float(&self, name: &str) -> std::result::Result<f64, HandlerError> {
        let value = self.json(name)?;
        value.as_f64().ok_or_else(|| type_error(name, "float", value))
    }

    pub fn bool(&self, name: &str) -> std::result::Result<bool, HandlerError> {
        let value = self.json(name)?;
        value.as_bool().ok_or_else(|| type_error(name, "bool", value))
    }
}

fn type_error(name: &str, expected: &str, got: &serde_json::Value) -> HandlerError {
    HandlerError::new(format!("argument '{name}' must be {expected}, got {got}"))
}

/// Access to state from inside a foreground handler.
///
/// Reads and writes go to the node the handler is declared on; fields of
/// ancestors are reachable the same way.
pub struct HandlerContext {
    token: String,
    tree: StateTree,
    node: Arc<StateNode>,
}

impl HandlerContext {
    pub(crate) fn new(token: impl Into<String>, tree: StateTree, node: Arc<StateNode>) -> Self {
        Self {
            token: token.into(),
            tree,
            node,
        }
    }

    /// Client token of the event being processed.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn node(&self) -> &Arc<StateNode> {
        &self.node
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    pub fn get(&self, field: &str) -> Result<Value> {
        self.node.get(field)
    }

    /// Field for in-place editing (proxied when it is a container).
    pub fn item(&self, field: &str) -> Result<Item> {
        self.node.item(field)
    }

    pub fn set(&self, field: &str, value: impl Into<Arg>) -> Result<()> {
        self.node.set(field, value)
    }

    /// Another node of the same tree, by declared path.
    pub fn state(&self, declared_path: &str) -> Result<Arc<StateNode>> {
        self.tree.substate(declared_path)
    }

    pub fn is_settable(&self, field: &str) -> bool {
        self.node.is_settable(field)
    }
}

/// A lazy, finite sequence of progress steps.
///
/// The processor calls [`Steps::next_step`] until it returns `None`, flushing
/// a partial update after each step. A producer is consumed once.
pub trait Steps: Send {
    fn next_step(
        &mut self,
        ctx: &mut HandlerContext,
    ) -> Option<std::result::Result<Vec<EventSpec>, HandlerError>>;
}

struct FnSteps<F>(F);

impl<F> Steps for FnSteps<F>
where
    F: FnMut(&mut HandlerContext) -> Option<std::result::Result<Vec<EventSpec>, HandlerError>> + Send,
{
    fn next_step(
        &mut self,
        ctx: &mut HandlerContext,
    ) -> Option<std::result::Result<Vec<EventSpec>, HandlerError>> {
        (self.0)(ctx)
    }
}

/// Progressive output from a closure called once per step.
pub fn steps<F>(step: F) -> HandlerOutput
where
    F: FnMut(&mut HandlerContext) -> Option<std::result::Result<Vec<EventSpec>, HandlerError>>
        + Send
        + 'static,
{
    HandlerOutput::Steps(Box::new(FnSteps(step)))
}

/// What a foreground handler returns.
pub enum HandlerOutput {
    None,
    Event(EventSpec),
    Events(Vec<EventSpec>),
    Steps(Box<dyn Steps>),
}

impl From<EventSpec> for HandlerOutput {
    fn from(event: EventSpec) -> Self {
        HandlerOutput::Event(event)
    }
}

impl From<Vec<EventSpec>> for HandlerOutput {
    fn from(events: Vec<EventSpec>) -> Self {
        HandlerOutput::Events(events)
    }
}

impl From<Option<EventSpec>> for HandlerOutput {
    fn from(event: Option<EventSpec>) -> Self {
        match event {
            Some(event) => HandlerOutput::Event(event),
            None => HandlerOutput::None,
        }
    }
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerOutput::None => write!(f, "None"),
            HandlerOutput::Event(event) => f.debug_tuple("Event").field(event).finish(),
            HandlerOutput::Events(events) => f.debug_tuple("Events").field(events).finish(),
            HandlerOutput::Steps(_) => write!(f, "Steps(..)"),
        }
    }
}
