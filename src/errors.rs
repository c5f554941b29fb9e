//! Named error kinds for the bridge's error handling design.
//!
//! Internal modules return `Result<T, BridgeError>` so the session driver
//! can match on kind and apply the recovery spec.md requires (reconnect,
//! fail-fast, or ignore). Call-handling boundaries convert to
//! `anyhow::Error` for logging, the same pattern the rest of the crate's
//! ambient code follows.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("provider handshake failed: {0}")]
    ProviderHandshakeFailed(String),

    #[error("provider transport error: {0}")]
    ProviderTransportError(String),

    #[error("provider rate limit: {0}")]
    ProviderRateLimit(String),

    #[error("unknown tool: {0}")]
    ToolUnknown(String),

    #[error("tool timed out: {0}")]
    ToolTimeout(String),

    #[error("tool error: {0}")]
    ToolError(String),

    #[error("recording sink error: {0}")]
    RecordingSinkError(String),

    #[error("cost sink error: {0}")]
    CostSinkError(String),
}

impl BridgeError {
    /// Whether this error kind should end the call immediately rather than
    /// be absorbed locally (tool errors are recoverable; see spec §7).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ProviderRateLimit(_) | BridgeError::ProviderHandshakeFailed(_)
        )
    }

    /// Whether this error kind should trigger a single reconnect attempt
    /// within 2s before ending the call (transport errors only).
    pub fn should_reconnect(&self) -> bool {
        matches!(self, BridgeError::ProviderTransportError(_))
    }
}
