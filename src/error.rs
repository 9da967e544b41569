//! Error taxonomy for the bus facade.
//!
//! Every failure a caller can observe is a variant of [`BusError`]. Handler
//! failures during dispatch are deliberately absent: they are caught, logged,
//! and never propagate into the transport loop or abort delivery to sibling
//! subscribers.

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced by bus operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// A value could not be serialized for transport
    #[error("failed to encode value as {target}: {detail}")]
    Encode {
        /// Declared source type
        target: &'static str,
        /// Serializer diagnostic
        detail: String,
    },

    /// A payload could not be reconstructed against the declared target type.
    /// The serializer diagnostic names the offending field and position.
    #[error("failed to decode payload as {target}: {detail}")]
    Decode {
        /// Declared target type
        target: &'static str,
        /// Deserializer diagnostic
        detail: String,
    },

    /// The active transport cannot honor the requested operation
    #[error("`{operation}` is not supported by the {transport} transport")]
    Unsupported {
        /// Operation that was attempted
        operation: &'static str,
        /// Name of the active transport
        transport: &'static str,
    },

    /// A non-blocking or timed queue get found no item
    #[error("queue `{0}` is empty")]
    QueueEmpty(String),

    /// A non-blocking or timed queue put found no room
    #[error("queue `{0}` is full")]
    QueueFull(String),

    /// No response arrived for a single-mode RPC call within the deadline
    #[error("call to `{addr}` timed out before a response arrived")]
    RpcTimeout {
        /// Address the call was sent to
        addr: String,
    },

    /// The responder invoked the target and it failed; carries the remote
    /// error text
    #[error("remote `{addr}` failed: {detail}")]
    Rpc {
        /// Address the call was sent to
        addr: String,
        /// Error text reported by the responder
        detail: String,
    },

    /// No callable is registered under the given address
    #[error("no callable exposed under `{0}`")]
    NoSuchRemote(String),

    /// A pending wait was released by lifecycle teardown
    #[error("bus is shutting down")]
    Shutdown,

    /// `init` was called while a process-wide bus is already active
    #[error("a bus is already initialized for this process")]
    AlreadyInitialized,

    /// A facade operation ran before `init`
    #[error("no bus has been initialized for this process")]
    NotInitialized,

    /// Driver-level transport failure (connection loss, kernel object error)
    #[error("transport failure: {0}")]
    Transport(String),
}

impl BusError {
    /// Wrap a driver-level failure
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        BusError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::transport(err)
    }
}
