//! Event handling: handler contexts, exception callbacks and the processor.

pub mod background;
pub mod exception;
pub mod handler;
pub mod processor;

pub use background::BackgroundContext;
pub use exception::{CallableKind, ExceptionDomain, ExceptionHandler, ParamType, ReturnKind};
pub use handler::{steps, Args, HandlerContext, HandlerError, HandlerOutput, Steps};
pub use processor::EventProcessor;
