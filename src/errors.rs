// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Every fallible engine operation returns `Result<T, EngineError>`. The
// variants map one-to-one onto the stable error codes surfaced at the API
// boundary; Transient errors inside a runtime are logged and swallowed, and
// escalate to Permanent only after repeated failures.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: invalid algorithm, unknown indicator reference,
    /// bad parameter values.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced instance, algorithm, or backtest does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The operation conflicts with current state (e.g. starting an
    /// already-RUNNING instance).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A recoverable upstream failure (broker timeout, reconnect in
    /// progress). Logged and retried; never changes instance status on its
    /// own.
    #[error("transient error: {0}")]
    Transient(String),

    /// An unrecoverable upstream failure (auth rejected with valid-looking
    /// credentials, or repeated Transient failures).
    #[error("permanent error: {0}")]
    Permanent(String),

    /// An engine invariant was violated. The offending runtime is stopped.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Stable machine-readable code for the API boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Transient(_) => "TRANSIENT",
            Self::Permanent(_) => "PERMANENT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status the API layer maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::Transient(_) => 503,
            Self::Permanent(_) => 502,
            Self::Internal(_) => 500,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
