//! Errors surfaced to controller-side callers.

use std::time::Duration;

use crate::bridge::protocol::RemoteError;

/// Everything a forwarded call, a handshake or a dispose can fail with.
///
/// `Clone` because a single event (worker exit, failed handshake) rejects
/// every pending call with the same error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProxyError {
    /// The remote method failed. Displays as the remote message verbatim.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker initialization failed: {0}")]
    InitFailed(RemoteError),

    #[error("worker did not initialize within {0:?}")]
    InitTimeout(Duration),

    #[error("worker exited unexpectedly")]
    WorkerExited,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown method `{method}` on {contract}")]
    UnknownMethod {
        contract: &'static str,
        method: String,
    },

    #[error("`{method}` takes {expected} argument(s), got {actual}")]
    ArityMismatch {
        method: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("failed to encode arguments: {0}")]
    Encode(String),

    #[error("failed to decode result: {0}")]
    Decode(String),

    #[error("worker has been disposed")]
    Disposed,

    /// The settling half of a task was dropped without settling it.
    #[error("task was dropped before it settled")]
    Abandoned,
}

impl ProxyError {
    /// The structured remote error, if this failure came from the worker.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) | Self::InitFailed(e) => Some(e),
            _ => None,
        }
    }
}
