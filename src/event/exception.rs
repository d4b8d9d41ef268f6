//! Exception callbacks for UI-side and handler-side failures.
//!
//! A callback describes its own signature (callable kind, parameters and
//! return shape) so it can be checked once when the app is built instead of
//! failing the first time an error needs reporting.

use crate::error::{Result, SyncError};
use crate::event::HandlerError;
use crate::types::EventSpec;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Where a reported error originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionDomain {
    Frontend,
    Backend,
}

impl fmt::Display for ExceptionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionDomain::Frontend => write!(f, "frontend"),
            ExceptionDomain::Backend => write!(f, "backend"),
        }
    }
}

/// How the callback was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallableKind {
    /// A named function.
    Function,
    /// A method bound to a receiver.
    Method,
    /// An anonymous closure; cannot be identified in logs.
    Closure,
    /// A function with some arguments pre-bound.
    Partial,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamType {
    Str,
    Int,
    Other(String),
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Str => write!(f, "str"),
            ParamType::Int => write!(f, "int"),
            ParamType::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Declared return shape of a callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnKind {
    Nothing,
    Event,
    OptionalEvent,
    Events,
    Other(String),
}

type ExceptionFn = Arc<dyn Fn(&str, &str) -> Vec<EventSpec> + Send + Sync>;

/// A configured exception callback.
#[derive(Clone)]
pub struct ExceptionHandler {
    name: String,
    kind: CallableKind,
    params: Vec<(String, ParamType)>,
    returns: ReturnKind,
    func: ExceptionFn,
}

const REQUIRED_PARAMS: [&str; 2] = ["message", "stack"];

impl ExceptionHandler {
    /// A named function taking `(message: str, stack: str)`.
    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str, &str) -> Vec<EventSpec> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: CallableKind::Function,
            params: REQUIRED_PARAMS
                .iter()
                .map(|p| (p.to_string(), ParamType::Str))
                .collect(),
            returns: ReturnKind::Events,
            func: Arc::new(func),
        }
    }

    /// A method bound to a receiver.
    pub fn method<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str, &str) -> Vec<EventSpec> + Send + Sync + 'static,
    {
        Self {
            kind: CallableKind::Method,
            ..Self::function(name, func)
        }
    }

    /// An anonymous closure. Rejected by [`ExceptionHandler::validate`].
    pub fn closure<F>(func: F) -> Self
    where
        F: Fn(&str, &str) -> Vec<EventSpec> + Send + Sync + 'static,
    {
        Self {
            kind: CallableKind::Closure,
            ..Self::function("<closure>", func)
        }
    }

    /// A partial application. Rejected by [`ExceptionHandler::validate`].
    pub fn partial<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str, &str) -> Vec<EventSpec> + Send + Sync + 'static,
    {
        Self {
            kind: CallableKind::Partial,
            ..Self::function(name, func)
        }
    }

    /// Override the declared parameters.
    pub fn with_params(mut self, params: Vec<(String, ParamType)>) -> Self {
        self.params = params;
        self
    }

    /// Override the declared return shape.
    pub fn with_returns(mut self, returns: ReturnKind) -> Self {
        self.returns = returns;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CallableKind {
        self.kind
    }

    /// Check the callback can serve `domain`.
    pub fn validate(&self, domain: ExceptionDomain) -> Result<()> {
        let name = &self.name;
        let invalid = |detail: String| {
            Err(SyncError::ConfigValidation(format!(
                "Provided custom {domain} exception handler `{name}` {detail}"
            )))
        };
        match self.kind {
            CallableKind::Partial => {
                return invalid("is a partial function. Please provide a named function instead.".into())
            }
            CallableKind::Closure => {
                return invalid("is a closure. Please use a named function instead.".into())
            }
            CallableKind::Function | CallableKind::Method => {}
        }
        for required in REQUIRED_PARAMS {
            match self.params.iter().find(|(p, _)| p == required) {
                None => return invalid(format!("does not take the required argument `{required}`")),
                Some((_, ty)) if *ty != ParamType::Str => {
                    return invalid(format!(
                        "has the wrong type for {required} argument. Expected `str` but got `{ty}`"
                    ))
                }
                Some(_) => {}
            }
        }
        if let Some((extra, _)) = self.params.iter().find(|(p, _)| !REQUIRED_PARAMS.contains(&p.as_str())) {
            return invalid(format!(
                "takes the unexpected argument `{extra}`. Expected exactly `message` and `stack`"
            ));
        }
        if domain == ExceptionDomain::Backend {
            if let ReturnKind::Other(got) = &self.returns {
                return invalid(format!(
                    "has the wrong return type. Expected `EventSpec`, `Vec<EventSpec>` or nothing but got `{got}`"
                ));
            }
        }
        Ok(())
    }

    /// Run the callback, returning the follow-up events it asks for.
    ///
    /// A panicking callback is logged and yields no events.
    pub fn call(&self, message: &str, stack: &str) -> Vec<EventSpec> {
        catch_unwind(AssertUnwindSafe(|| (self.func)(message, stack))).unwrap_or_else(|panic| {
            let panic = HandlerError::from_panic(panic);
            tracing::error!(handler = %self.name, panic = %panic.message, %message, "exception handler panicked");
            Vec::new()
        })
    }

    /// Logs UI-side errors.
    pub fn default_frontend() -> Self {
        Self::function("default_frontend_exception_handler", |message, stack| {
            tracing::error!(%message, %stack, "[Frontend Exception]");
            Vec::new()
        })
        .with_returns(ReturnKind::Nothing)
    }

    /// Logs handler errors.
    pub fn default_backend() -> Self {
        Self::function("default_backend_exception_handler", |message, stack| {
            tracing::error!(%message, %stack, "[Backend Exception]");
            Vec::new()
        })
        .with_returns(ReturnKind::Nothing)
    }
}

impl fmt::Debug for ExceptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHandler")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &str, _: &str) -> Vec<EventSpec> {
        Vec::new()
    }

    fn message_of(result: Result<()>) -> String {
        match result {
            Err(SyncError::ConfigValidation(message)) => message,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_named_function_and_method_valid() {
        for domain in [ExceptionDomain::Frontend, ExceptionDomain::Backend] {
            assert!(ExceptionHandler::function("valid_custom_handler", noop).validate(domain).is_ok());
            assert!(ExceptionHandler::method("handle", noop).validate(domain).is_ok());
        }
    }

    #[test]
    fn test_extra_params_rejected() {
        let handler = ExceptionHandler::function("with_logger", noop).with_params(vec![
            ("message".into(), ParamType::Str),
            ("stack".into(), ParamType::Str),
            ("logger".into(), ParamType::Str),
        ]);
        let message = message_of(handler.validate(ExceptionDomain::Backend));
        assert!(message.contains("unexpected argument `logger`"));
        assert!(message.contains("with_logger"));
    }

    #[test]
    fn test_partial_rejected() {
        let message = message_of(ExceptionHandler::partial("valid_custom_handler", noop).validate(ExceptionDomain::Frontend));
        assert!(message.contains("partial function"));
        assert!(message.contains("frontend"));
    }

    #[test]
    fn test_closure_rejected() {
        let message = message_of(ExceptionHandler::closure(noop).validate(ExceptionDomain::Backend));
        assert!(message.contains("is a closure"));
    }

    #[test]
    fn test_wrong_argspec_rejected() {
        let handler = ExceptionHandler::function("wrong_argspec", noop).with_params(vec![
            ("message".into(), ParamType::Int),
            ("stack".into(), ParamType::Str),
        ]);
        let message = message_of(handler.validate(ExceptionDomain::Frontend));
        assert!(message.contains("wrong type for message"));

        let handler = ExceptionHandler::function("no_stack", noop)
            .with_params(vec![("message".into(), ParamType::Str)]);
        let message = message_of(handler.validate(ExceptionDomain::Backend));
        assert!(message.contains("required argument `stack`"));
    }

    #[test]
    fn test_backend_return_type_checked() {
        let handler = ExceptionHandler::function("returns_int", noop).with_returns(ReturnKind::Other("int".into()));
        assert!(handler.validate(ExceptionDomain::Frontend).is_ok());
        let message = message_of(handler.validate(ExceptionDomain::Backend));
        assert!(message.contains("wrong return type"));

        for returns in [ReturnKind::Nothing, ReturnKind::Event, ReturnKind::OptionalEvent, ReturnKind::Events] {
            let handler = ExceptionHandler::function("ok", noop).with_returns(returns);
            assert!(handler.validate(ExceptionDomain::Backend).is_ok());
        }
    }

    #[test]
    fn test_call_returns_events() {
        let handler = ExceptionHandler::function("alert", |message, _| {
            vec![EventSpec::new("_call_script").with_arg("message", serde_json::json!(message))]
        });
        let events = handler.call("boom", "");
        assert_eq!(events.len(), 1);
        assert!(ExceptionHandler::default_backend().call("boom", "").is_empty());
    }
}
