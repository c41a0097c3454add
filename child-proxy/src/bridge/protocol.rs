//! Wire protocol types for controller-worker communication.
//!
//! One bidirectional channel (the worker's stdin/stdout):
//! - **WorkerRequest** (controller -> worker): Init, Work, Dispose
//! - **WorkerResponse** (worker -> controller): Initialized, InitFailed, Result,
//!   Rejection, DisposeCompleted, Log

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::logging::LoggingContext;

/// First argument of a worker process started by a controller.
///
/// Deliberately unlikely as a real command line argument: a worker binary
/// run by hand must not start listening on its stdio.
pub const AUTO_START: &str = "--child-proxy-autostart-5f0e9c4d7a";

/// Index of a call in the controller's correlation table.
pub type CorrelationId = u64;

/// Messages from controller to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Sent immediately after spawn (must be first message).
    Init {
        /// Name of the target factory registered in the worker.
        require_path: String,
        constructor_args: Vec<Value>,
        /// Plugins to load before the target is constructed.
        plugins: Vec<String>,
        logging_context: LoggingContext,
    },

    Work {
        correlation_id: CorrelationId,
        method_name: String,
        args: Vec<Value>,
    },

    Dispose,
}

/// Messages from worker to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResponse {
    Initialized,

    /// Plugin loading or target construction failed; no Initialized will follow.
    InitFailed {
        error: RemoteError,
    },

    Result {
        correlation_id: CorrelationId,
        result: Value,
    },

    Rejection {
        correlation_id: CorrelationId,
        error: RemoteError,
    },

    DisposeCompleted,

    /// Worker tracing event, re-emitted by the controller.
    Log {
        level: LogLevel,
        target: String,
        message: String,
    },
}

/// The `kind` tags a message enum can carry on the wire.
pub trait MessageKinds {
    const KINDS: &'static [&'static str];
}

impl MessageKinds for WorkerRequest {
    const KINDS: &'static [&'static str] = &["init", "work", "dispose"];
}

impl MessageKinds for WorkerResponse {
    const KINDS: &'static [&'static str] = &[
        "initialized",
        "init_failed",
        "result",
        "rejection",
        "dispose_completed",
        "log",
    ];
}

/// A decoded frame.
///
/// An unknown `kind` never tears down the stream. A known `kind` whose body
/// does not match is kept apart from unknown ones, with its correlation id
/// when one can be read, so the call it names can still be settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<T> {
    Known(T),
    Malformed {
        kind: String,
        correlation_id: Option<CorrelationId>,
        error: String,
    },
    Unrecognized(Value),
}

impl<T: DeserializeOwned + MessageKinds> Inbound<T> {
    pub fn classify(value: Value) -> Self {
        let Some(kind) = value
            .get("kind")
            .and_then(Value::as_str)
            .filter(|kind| T::KINDS.contains(kind))
            .map(str::to_owned)
        else {
            return Self::Unrecognized(value);
        };
        let correlation_id = value.get("correlation_id").and_then(Value::as_u64);

        match serde_json::from_value(value) {
            Ok(message) => Self::Known(message),
            Err(e) => Self::Malformed {
                kind,
                correlation_id,
                error: e.to_string(),
            },
        }
    }
}

impl<'de, T: DeserializeOwned + MessageKinds> Deserialize<'de> for Inbound<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::classify)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// Structured error envelope crossing the process boundary.
///
/// `kind` keeps the failure classification the worker saw; `Display` is the
/// message alone so callers see exactly what the remote side reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// A method failure with no more specific classification.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("error", message)
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new("unknown_method", format!("no method named `{method}`"))
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new("invalid_arguments", message)
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new("panic", message)
    }

    pub fn malformed_request(message: impl Into<String>) -> Self {
        Self::new("malformed_request", message)
    }

    pub fn not_initialized() -> Self {
        Self::new("not_initialized", "worker has not been initialized")
    }
}

impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        let detail = format!("{err:?}");
        Self::failed(err.to_string()).with_detail(detail)
    }
}
