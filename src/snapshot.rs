//! First-paint snapshots.
//!
//! A snapshot is built from a fresh tree that is never stored, so it shares
//! nothing with any client's live tree.

use crate::delta::full_snapshot;
use crate::error::{Result, SyncError};
use crate::event::processor::run_to_completion;
use crate::event::{HandlerContext, HandlerError};
use crate::minify::Schema;
use crate::state::{HandlerDef, StateNode, StateTree, ROUTER_FIELD};
use crate::types::{Delta, Payload};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Token used for handlers run while building a snapshot.
pub const SNAPSHOT_TOKEN: &str = "";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Requested page path, e.g. `"/todos"`.
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub client_ip: Option<String>,
}

impl SnapshotRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Full tree, or `None` when the app declares no state.
    pub state: Option<Delta>,
    pub headers: Vec<(String, String)>,
}

impl SnapshotResponse {
    fn new(state: Option<Delta>) -> Self {
        Self {
            state,
            headers: vec![("cache-control".to_string(), "no-cache".to_string())],
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Router value for a request: page, normalized headers and session.
pub fn router_value(request: &SnapshotRequest) -> Value {
    let headers: serde_json::Map<String, serde_json::Value> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase().replace('-', "_"), json!(value)))
        .collect();
    let raw = json!({
        "page": {"path": request.path, "raw_path": request.path, "params": {}},
        "headers": headers,
        "session": {"client_ip": request.client_ip.clone().unwrap_or_default()},
    });
    Value::from_json(&raw)
}

/// Find a handler by declared path (`"state.page.load"`).
pub(crate) fn declared_handler(tree: &StateTree, path: &str) -> Result<(Arc<StateNode>, HandlerDef)> {
    let (node_path, name) = path
        .rsplit_once('.')
        .ok_or_else(|| SyncError::StateResolution(path.to_string()))?;
    let node = tree.substate(node_path)?;
    let handler = node
        .handler(name)
        .ok_or_else(|| SyncError::StateResolution(format!("{path}: no such handler")))?;
    if handler.is_background() {
        return Err(SyncError::InvalidOperation(format!(
            "{path}: background handlers cannot run on load"
        )));
    }
    Ok((node, handler))
}

/// Build the snapshot for `request`, running `on_load` handlers first.
///
/// If any handler fails the untouched defaults are returned instead.
pub fn snapshot(
    schema: Option<&Arc<Schema>>,
    on_load: &[String],
    request: &SnapshotRequest,
) -> Result<SnapshotResponse> {
    let Some(schema) = schema else {
        return Ok(SnapshotResponse::new(None));
    };

    let tree = StateTree::new(Arc::clone(schema));
    tree.root().set(ROUTER_FIELD, router_value(request))?;

    match run_on_load(&tree, on_load).and_then(|()| render(&tree)) {
        Ok(state) => Ok(SnapshotResponse::new(Some(state))),
        Err(message) => {
            tracing::warn!(path = %request.path, error = %message, "on_load failed; returning defaults");
            let defaults = StateTree::new(Arc::clone(schema));
            Ok(SnapshotResponse::new(Some(full_snapshot(&defaults)?)))
        }
    }
}

/// Full snapshot of `tree`, with computed field failures and panics
/// rendered as messages.
fn render(tree: &StateTree) -> std::result::Result<Delta, String> {
    catch_unwind(AssertUnwindSafe(|| full_snapshot(tree)))
        .map_err(|panic| HandlerError::from_panic(panic).message)?
        .map_err(|e| e.to_string())
}

fn run_on_load(tree: &StateTree, on_load: &[String]) -> std::result::Result<(), String> {
    for path in on_load {
        let (node, handler) = declared_handler(tree, path).map_err(|e| e.to_string())?;
        let mut ctx = HandlerContext::new(SNAPSHOT_TOKEN, tree.clone(), node);
        run_to_completion(&handler, &mut ctx, &Payload::new()).map_err(|e| e.message)?;
    }
    Ok(())
}
