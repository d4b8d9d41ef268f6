//! Core wire types exchanged with the transport layer.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Changed fields of one node, keyed by field wire name.
pub type FieldDelta = BTreeMap<String, serde_json::Value>;

/// Changed nodes, keyed by node wire path (e.g. `"state.todo_state"`).
pub type Delta = BTreeMap<String, FieldDelta>;

/// Inbound event payload, matched by name against handler parameters.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Handler path reserved for errors reported by the UI layer.
pub const FRONTEND_EXCEPTION_EVENT: &str = "__frontend_exception";

/// An event delivered by the transport for one client token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Client session the event belongs to.
    pub token: String,

    /// Dotted node path followed by the handler name.
    pub handler_path: String,

    /// Handler arguments.
    #[serde(default)]
    pub payload: Payload,

    /// Page and session information supplied by the UI.
    #[serde(default)]
    pub router_context: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Create an event with an empty payload.
    pub fn new(token: impl Into<String>, handler_path: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            handler_path: handler_path.into(),
            payload: Payload::new(),
            router_context: serde_json::Map::new(),
        }
    }

    /// Add a payload argument.
    pub fn with_arg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }

    /// Attach router context.
    pub fn with_router(mut self, router: serde_json::Map<String, serde_json::Value>) -> Self {
        self.router_context = router;
        self
    }
}

/// A follow-up event for the UI to dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    pub handler_path: String,
    #[serde(default)]
    pub payload: Payload,
}

impl EventSpec {
    pub fn new(handler_path: impl Into<String>) -> Self {
        Self {
            handler_path: handler_path.into(),
            payload: Payload::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }

    /// Promote to a full event for a token.
    pub fn into_event(self, token: impl Into<String>) -> Event {
        Event {
            token: token.into(),
            handler_path: self.handler_path,
            payload: self.payload,
            router_context: serde_json::Map::new(),
        }
    }
}

/// Outbound update; one or more are produced per processed event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// Dirty fields since the previous flush.
    pub delta: Delta,

    /// Events the UI should dispatch next.
    pub events: Vec<EventSpec>,

    /// Whether this is the last update for the event.
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.delta.is_empty() && self.events.is_empty()
    }
}

/// Sending half of an update stream.
pub type UpdateSender = Sender<StateUpdate>;

/// Handle to receive updates produced while processing events.
pub struct UpdateStream {
    sender: Sender<StateUpdate>,
    receiver: Receiver<StateUpdate>,
}

impl UpdateStream {
    /// Create a new, unbounded stream.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Sender to hand to the processor (and its background tasks).
    pub fn sender(&self) -> UpdateSender {
        self.sender.clone()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StateUpdate, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Try to receive an update (non-blocking).
    pub fn try_recv(&self) -> Result<StateUpdate, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain every update currently queued.
    pub fn drain(&self) -> Vec<StateUpdate> {
        self.receiver.try_iter().collect()
    }
}

impl Default for UpdateStream {
    fn default() -> Self {
        Self::new()
    }
}
