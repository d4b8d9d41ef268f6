//! # statesync
//!
//! Per-client state trees kept on the server and synchronized incrementally
//! to a remote UI through event dispatch.
//!
//! ## Core Concepts
//!
//! - **State tree**: typed nodes declared in a [`StateRegistry`], one tree
//!   per client token
//! - **Proxies**: in-place edits of nested containers that mark the owning
//!   field dirty
//! - **Events**: handler invocations that produce deltas of dirty fields
//! - **State managers**: memory, disk or shared-cache storage with an
//!   exclusive lease per token
//! - **Minification**: short sibling-scoped wire ids for states, handlers
//!   and fields
//!
//! ## Example
//!
//! ```ignore
//! use statesync::{App, Event, HandlerOutput, StateRegistry, StateType, UpdateStream};
//!
//! let mut registry = StateRegistry::new(StateType::new("state"))?;
//! registry.register(
//!     "state",
//!     StateType::new("counter")
//!         .field("value", 0)
//!         .handler("increment", &[], |ctx, _| {
//!             let value = ctx.get("value")?.as_int().unwrap_or(0);
//!             ctx.set("value", value + 1)?;
//!             Ok(HandlerOutput::None)
//!         }),
//! )?;
//!
//! let app = App::builder().state(registry).build()?;
//! let updates = UpdateStream::new();
//! app.process(Event::new("token", "state.counter.increment"), &updates.sender())?;
//! ```

pub mod app;
pub mod config;
pub mod delta;
pub mod error;
pub mod event;
pub mod manager;
pub mod minify;
pub mod proxy;
pub mod snapshot;
pub mod state;
pub mod types;
pub mod value;

// Re-exports
pub use app::{App, AppBuilder};
pub use config::AppConfig;
pub use delta::{collect_delta, full_snapshot};
pub use error::{Result, SyncError};
pub use event::{
    steps, Args, BackgroundContext, CallableKind, EventProcessor, ExceptionDomain, ExceptionHandler,
    HandlerContext, HandlerError, HandlerOutput, ParamType, ReturnKind, Steps,
};
pub use manager::{
    CacheClient, CacheStateManager, DiskStateManager, LockTiming, MemoryCache, MemoryStateManager,
    StateLease, StateManager, StateManagerMode,
};
pub use minify::{
    compact_to_int, int_to_compact, MinifyCache, MinifyConfig, MinifyMode, MinifyToggles, Schema,
    ValidationReport,
};
pub use proxy::{unwrap_arg, Arg, Item, MutableProxy};
pub use snapshot::{SnapshotRequest, SnapshotResponse};
pub use state::{ResolutionPolicy, StateNode, StateRegistry, StateTree, StateType};
pub use types::*;
pub use value::Value;
