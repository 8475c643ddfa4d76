//! Error types for the bridge.
//!
//! One crate-wide taxonomy: launch failures are fatal and surfaced
//! immediately; protocol/decoding failures poison the session (the channel
//! framing can no longer be trusted) and the session should be relaunched
//! rather than reused; parse and unsupported-type failures are recoverable
//! by the caller. Interruption is not an error — see
//! [`EvalOutcome`](crate::eval::EvalOutcome).

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RBridgeError>;

/// Errors produced by bridge operations.
#[derive(Debug, Error)]
pub enum RBridgeError {
    /// The engine executable could not be spawned.
    #[error("failed to launch engine: {0}")]
    Launch(#[source] std::io::Error),

    /// The engine exited, its stream closed unexpectedly, or the session
    /// was already shut down.
    #[error("engine closed: {0}")]
    EngineClosed(String),

    /// The completeness oracle classified the code as incomplete or
    /// unrecoverable, or an assignment target failed to parse.
    #[error("parse error at line {line}, column {column}: {message}")]
    Parse {
        line: u32,
        column: u32,
        message: String,
    },

    /// The engine-side value has no wire encoding. Carries the engine's
    /// diagnostic (typically the class name of the offending object).
    #[error("unsupported engine type: {0}")]
    UnsupportedType(String),

    /// Framing-level failure: unknown tag, declared length over the sanity
    /// ceiling, or a handshake version mismatch. Fatal for the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The data-channel listener could not bind after bounded retries.
    #[error("could not bind data channel near port {base_port}: {source}")]
    ChannelBind {
        base_port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A bounded wait expired.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error on the text or binary stream.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for RBridgeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                RBridgeError::EngineClosed(err.to_string())
            }
            _ => RBridgeError::Io(err),
        }
    }
}

impl RBridgeError {
    /// True if the session must be torn down and relaunched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RBridgeError::Launch(_)
                | RBridgeError::EngineClosed(_)
                | RBridgeError::Protocol(_)
                | RBridgeError::ChannelBind { .. }
        )
    }
}
