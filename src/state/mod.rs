//! The state tree: type registry, nodes and per-client trees.

pub mod node;
pub mod registry;
pub mod tree;

pub use node::StateNode;
pub use registry::{
    BackgroundFn, ComputeFn, ComputedDef, FieldDef, HandlerDef, HandlerFn, HandlerKind, RegisteredType,
    StateRegistry, StateType, ROUTER_FIELD, SETTER_PREFIX, SETVAR_HANDLER,
};
pub use tree::{ResolutionPolicy, StateTree};
