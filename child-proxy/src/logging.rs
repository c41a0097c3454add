//! Tracing setup for both sides of the proxy.
//!
//! The controller process logs through an ordinary `fmt` subscriber. A worker
//! process has no usable stderr contract with its controller, so it ships
//! every event over IPC as a `log` message and the controller re-emits it
//! under the `child_proxy::worker` target.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::bridge::protocol::{LogLevel, WorkerResponse};

/// Environment variable holding the default log level or filter directive.
pub const LOG_ENV: &str = "CHILD_PROXY_LOG";

/// Events from this target are never forwarded (each would encode another frame).
const CODEC_TARGET: &str = "child_proxy::bridge::codec";

/// Logging settings handed to the worker in `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingContext {
    /// An `EnvFilter` directive, e.g. `info` or `calculator=debug,info`.
    pub filter: String,
}

impl LoggingContext {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
        }
    }

    /// Filter from `CHILD_PROXY_LOG`, `info` if unset.
    pub fn from_env() -> Self {
        match std::env::var(LOG_ENV) {
            Ok(filter) if !filter.trim().is_empty() => Self::new(filter),
            _ => Self::default(),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|e| {
            eprintln!("invalid worker log filter {:?}: {e}", self.filter);
            EnvFilter::new("info")
        })
    }
}

impl Default for LoggingContext {
    fn default() -> Self {
        Self::new("info")
    }
}

/// Install the controller-side subscriber.
///
/// `RUST_LOG` wins if set; otherwise `CHILD_PROXY_LOG` picks the level for
/// this crate. `LOG_FORMAT=json` switches to JSON lines. Always writes to
/// stderr. Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var(LOG_ENV).as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "child_proxy={level},child_proxy::bridge::codec=off",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Install the worker-side subscriber: `context.filter` plus [`ForwardingLayer`].
///
/// Returns false if a global subscriber was already set.
pub(crate) fn init_worker_tracing(
    context: &LoggingContext,
    tx: mpsc::Sender<WorkerResponse>,
) -> bool {
    tracing_subscriber::registry()
        .with(ForwardingLayer::new(tx).with_filter(context.env_filter()))
        .try_init()
        .is_ok()
}

/// Ships tracing events to the controller as [`WorkerResponse::Log`].
///
/// Uses `try_send`: when the channel is full the event is dropped rather
/// than blocking the thread that logged it.
pub struct ForwardingLayer {
    tx: mpsc::Sender<WorkerResponse>,
}

impl ForwardingLayer {
    pub fn new(tx: mpsc::Sender<WorkerResponse>) -> Self {
        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(CODEC_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.try_send(WorkerResponse::Log {
            level: LogLevel::from(metadata.level()),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

/// Collects `message` plus any other fields as ` key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields
                .push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Re-emit a forwarded worker event on the controller side.
pub(crate) fn emit_worker_log(level: LogLevel, target: &str, message: &str) {
    match level {
        LogLevel::Trace => {
            tracing::trace!(target: "child_proxy::worker", worker_target = target, "{message}")
        }
        LogLevel::Debug => {
            tracing::debug!(target: "child_proxy::worker", worker_target = target, "{message}")
        }
        LogLevel::Info => {
            tracing::info!(target: "child_proxy::worker", worker_target = target, "{message}")
        }
        LogLevel::Warn => {
            tracing::warn!(target: "child_proxy::worker", worker_target = target, "{message}")
        }
        LogLevel::Error => {
            tracing::error!(target: "child_proxy::worker", worker_target = target, "{message}")
        }
    }
}
