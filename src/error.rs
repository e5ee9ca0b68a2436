//! Error types for the LSP driver core.
//!
//! One enum per concern, `#[from]` conversions where a lower layer's error
//! wraps cleanly, and small constructor helpers for variants that carry
//! free-form context.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by [`crate::initializer::LazyInitializer`].
///
/// Generic over the connection's own error type so callers see the
/// concrete transport failure rather than a type-erased blob.
#[derive(Debug, Error)]
pub enum InitializerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The initialize-params provider failed.
    #[error("initialize-params provider failed: {0}")]
    ProviderFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The underlying connection reported a failure.
    #[error("connection error: {0}")]
    Connection(#[from] E),

    /// The server replied to a request with a JSON-RPC error object.
    #[error("request dispatch failed: {method} returned {code}: {message}")]
    RequestDispatchFailed {
        method: String,
        code: i32,
        message: String,
    },

    /// A response body could not be decoded into the caller's expected type.
    #[error("failed to decode response to {method}: {source}")]
    ResponseDecode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    /// Internal state machine reached a combination that should be
    /// unreachable. Implies a bug in this crate.
    #[error("invalid initializer state: {0}")]
    StateInvalid(String),
}

impl<E> InitializerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn provider_failed(
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ProviderFailed(Box::new(source))
    }

    pub fn state_invalid(description: impl Into<String>) -> Self {
        Self::StateInvalid(description.into())
    }
}

/// Errors raised by [`crate::supervisor::Supervisor`].
///
/// Wraps [`InitializerError`] plus the restart-specific failure modes:
/// a call made while a planned shutdown or the post-crash cool-down is in
/// progress, and failures from the caller-supplied providers.
#[derive(Debug, Error)]
pub enum SupervisorError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The inner [`LazyInitializer`](crate::initializer::LazyInitializer)
    /// reported a failure.
    #[error(transparent)]
    Initializer(#[from] InitializerError<E>),

    /// A required configuration callback was not supplied to the builder.
    #[error("missing required supervisor provider: {0}")]
    NoProvider(&'static str),

    /// The `server_provider` factory failed while spawning a fresh
    /// connection.
    #[error("failed to spawn server connection: {0}")]
    SpawnFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A call was made while shutting down, or during the post-crash
    /// cool-down window before the next restart is armed.
    #[error("server stopped")]
    ServerStopped,
}

impl<E> SupervisorError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn spawn_failed(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::SpawnFailed(Box::new(source))
    }
}

/// Configuration error for [`crate::supervisor::SupervisorBuilder`].
#[derive(Debug, Error)]
pub enum SupervisorConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid restart cool-down {cooldown:?}: {reason}")]
    InvalidCooldown {
        cooldown: Duration,
        reason: &'static str,
    },
}

impl SupervisorConfigError {
    pub fn missing_field(field: &'static str) -> Self {
        Self::MissingField { field }
    }
}
