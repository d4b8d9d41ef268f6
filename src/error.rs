//! Error types for state synchronization.

use thiserror::Error;

/// Main error type for state operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A handler path or substate path did not resolve to a node.
    #[error("State resolution failed: {0}")]
    StateResolution(String),

    /// A mutation was attempted without holding exclusive access.
    #[error("Immutable state: {0}")]
    ImmutableState(String),

    /// The exclusive-access lease could not be acquired or ran out.
    #[error("Lock expired for token {token}: {reason}")]
    LockExpired { token: String, reason: String },

    /// Malformed or inconsistent configuration detected at load time.
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    /// User handler code failed; always routed to an exception callback.
    #[error("Handler {handler} failed: {message}")]
    HandlerInvocation { handler: String, message: String },

    #[error("Unknown field {field} on state {state}")]
    UnknownField { state: String, field: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid state blob format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("State directory is locked by another process")]
    Locked,
}

impl SyncError {
    pub(crate) fn lock_expired(token: &str, reason: impl Into<String>) -> Self {
        SyncError::LockExpired {
            token: token.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error only affects the event that raised it.
    ///
    /// Everything except configuration errors leaves the session usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::ConfigValidation(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::ConfigValidation(e.to_string())
    }
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, SyncError>;
