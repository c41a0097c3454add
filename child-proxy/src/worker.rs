//! Worker side of the proxy: runs inside the child process.
//!
//! The controller side (spawning, correlation, lifecycle) is in controller.rs.
//!
//! Architecture:
//! - One channel (the process's original stdin/stdout): Init, Work, Dispose in; Initialized,
//!   InitFailed, Result, Rejection, DisposeCompleted, Log out
//! - Each `work` runs on its own task; responses share one framed writer
//! - Tracing events are forwarded to the controller once `init` arrives

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{AUTO_START, Inbound, RemoteError, WorkerRequest, WorkerResponse};
use crate::bridge::revive::RevivalRegistry;
use crate::fd_redirect;
use crate::logging::{self, LoggingContext};

/// Forwarded log events buffered before new ones are dropped.
const LOG_BUFFER: usize = 1024;

type SharedWriter<W> = Arc<Mutex<FramedWrite<W, JsonCodec<WorkerResponse>>>>;

/// The object a worker exposes to its controller.
///
/// Usually generated: `remote_contract!` implements this for
/// [`Served`](crate::Served) services.
pub trait Target: Send + Sync + 'static {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<Value, RemoteError>>;

    /// Called once when the controller disposes the worker.
    fn dispose(&self) -> BoxFuture<'_, Result<(), RemoteError>> {
        Box::pin(async { Ok(()) })
    }
}

pub type TargetFactory = Arc<
    dyn Fn(Vec<Value>, &LoggingContext) -> Result<Arc<dyn Target>, RemoteError> + Send + Sync,
>;

/// Target factories by the name `init` refers to them with (`require_path`).
#[derive(Clone, Default)]
pub struct TargetRegistry {
    factories: HashMap<String, TargetFactory>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Target,
        F: Fn(Vec<Value>, &LoggingContext) -> Result<T, RemoteError> + Send + Sync + 'static,
    {
        let factory: TargetFactory = Arc::new(
            move |args: Vec<Value>,
                  context: &LoggingContext|
                  -> Result<Arc<dyn Target>, RemoteError> {
                Ok(Arc::new(factory(args, context)?))
            },
        );
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn with<T, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        T: Target,
        F: Fn(Vec<Value>, &LoggingContext) -> Result<T, RemoteError> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn create(
        &self,
        name: &str,
        args: Vec<Value>,
        context: &LoggingContext,
    ) -> Result<Arc<dyn Target>, RemoteError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            RemoteError::new("target_not_found", format!("no target registered as `{name}`"))
        })?;
        std::panic::catch_unwind(AssertUnwindSafe(|| factory(args, context)))
            .unwrap_or_else(|payload| Err(RemoteError::panicked(panic_message(payload.as_ref()))))
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Extension loaded by name during `init`, before the target is built.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    async fn load(&self, targets: &mut TargetRegistry) -> Result<(), RemoteError>;
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, plugin: impl Plugin + 'static) -> &mut Self {
        self.plugins.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn with(mut self, name: impl Into<String>, plugin: impl Plugin + 'static) -> Self {
        self.register(name, plugin);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.plugins.keys().collect();
        names.sort_unstable();
        f.debug_struct("PluginRegistry")
            .field("names", &names)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub targets: TargetRegistry,
    pub plugins: PluginRegistry,
    pub revivers: Arc<RevivalRegistry>,
    /// Install a subscriber forwarding tracing events to the controller on `init`.
    pub forward_logs: bool,
}

impl WorkerConfig {
    pub fn new(targets: TargetRegistry) -> Self {
        Self {
            targets,
            plugins: PluginRegistry::new(),
            revivers: Arc::new(RevivalRegistry::default()),
            forward_logs: true,
        }
    }

    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_revivers(mut self, revivers: Arc<RevivalRegistry>) -> Self {
        self.revivers = revivers;
        self
    }

    pub fn with_log_forwarding(mut self, enabled: bool) -> Self {
        self.forward_logs = enabled;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new(TargetRegistry::new())
    }
}

/// True if this process was started by a controller.
///
/// `args` is the full argument list including the program name, as returned
/// by `std::env::args()`. Worker binaries must check this before touching
/// stdin/stdout.
pub fn autostart_requested<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .nth(1)
        .is_some_and(|arg| arg.as_ref() == AUTO_START)
}

/// Serve the worker protocol on stdin/stdout until disposed or orphaned.
///
/// The channel is first moved off fds 0 and 1, so anything target code
/// prints to stdout lands on stderr instead of in the protocol stream.
pub async fn run_worker(config: WorkerConfig) -> io::Result<()> {
    let channel = fd_redirect::isolate_control_channel()?;
    serve(channel.reader, channel.writer, config).await
}

/// Serve the worker protocol over an arbitrary reader/writer pair.
///
/// Returns after answering `dispose`, or when the controller side closes.
pub async fn serve<R, W>(reader: R, writer: W, config: WorkerConfig) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let WorkerConfig {
        mut targets,
        plugins,
        revivers,
        forward_logs,
    } = config;

    let mut reader = FramedRead::new(
        reader,
        JsonCodec::<Inbound<WorkerRequest>>::with_revivers(Arc::clone(&revivers)),
    );
    let writer: SharedWriter<W> = Arc::new(Mutex::new(FramedWrite::new(
        writer,
        JsonCodec::with_revivers(revivers),
    )));

    // Forward tracing events to the controller
    let (log_tx, mut log_rx) = mpsc::channel::<WorkerResponse>(LOG_BUFFER);
    let mut log_tx = Some(log_tx);
    let writer_for_logs = Arc::clone(&writer);
    let log_forwarder = tokio::spawn(async move {
        while let Some(msg) = log_rx.recv().await {
            let mut w = writer_for_logs.lock().await;
            if w.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut target: Option<Arc<dyn Target>> = None;

    loop {
        let request = match reader.next().await {
            Some(Ok(Inbound::Known(request))) => request,
            Some(Ok(Inbound::Malformed {
                kind,
                correlation_id,
                error,
            })) => {
                tracing::error!(%kind, ?correlation_id, %error, "Malformed message from controller");
                let error =
                    RemoteError::malformed_request(format!("malformed `{kind}` message: {error}"));
                let response = match (kind.as_str(), correlation_id) {
                    (_, Some(correlation_id)) => WorkerResponse::Rejection {
                        correlation_id,
                        error,
                    },
                    ("init", None) if target.is_none() => WorkerResponse::InitFailed { error },
                    _ => continue,
                };
                writer.lock().await.send(response).await?;
                continue;
            }
            Some(Ok(Inbound::Unrecognized(raw))) => {
                tracing::warn!(message = %raw, "Unrecognized message from controller, dropping");
                continue;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Controller channel error");
                break;
            }
            None => {
                tracing::info!("Controller channel closed, exiting");
                break;
            }
        };

        match request {
            WorkerRequest::Init {
                require_path,
                constructor_args,
                plugins: plugin_names,
                logging_context,
            } => {
                if target.is_some() {
                    tracing::warn!("Received a second init, ignoring");
                    continue;
                }
                if forward_logs
                    && let Some(tx) = log_tx.take()
                    && !logging::init_worker_tracing(&logging_context, tx)
                {
                    tracing::debug!("Subscriber already installed, not forwarding logs");
                }

                let response = match initialize(
                    &mut targets,
                    &plugins,
                    &require_path,
                    constructor_args,
                    &plugin_names,
                    &logging_context,
                )
                .await
                {
                    Ok(created) => {
                        tracing::info!(%require_path, "Target initialized");
                        target = Some(created);
                        WorkerResponse::Initialized
                    }
                    Err(error) => {
                        tracing::error!(%require_path, %error, kind = %error.kind, "Initialization failed");
                        WorkerResponse::InitFailed { error }
                    }
                };
                writer.lock().await.send(response).await?;
            }

            WorkerRequest::Work {
                correlation_id,
                method_name,
                args,
            } => {
                let Some(target) = target.clone() else {
                    tracing::warn!(correlation_id, %method_name, "Work before init");
                    let rejection = WorkerResponse::Rejection {
                        correlation_id,
                        error: RemoteError::not_initialized(),
                    };
                    writer.lock().await.send(rejection).await?;
                    continue;
                };

                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    tracing::trace!(correlation_id, %method_name, "Running method");
                    let response = match run_method(target, &method_name, args).await {
                        Ok(result) => WorkerResponse::Result {
                            correlation_id,
                            result,
                        },
                        Err(error) => WorkerResponse::Rejection {
                            correlation_id,
                            error,
                        },
                    };
                    respond(&writer, correlation_id, response).await;
                });
            }

            WorkerRequest::Dispose => {
                tracing::info!("Dispose requested");
                if let Some(target) = target.take()
                    && let Err(error) = target.dispose().await
                {
                    tracing::warn!(%error, "Target dispose failed");
                }
                writer
                    .lock()
                    .await
                    .send(WorkerResponse::DisposeCompleted)
                    .await?;
                break;
            }
        }
    }

    // The installed subscriber keeps a sender alive, so the forwarder never
    // sees the channel close on its own.
    drop(log_tx);
    log_forwarder.abort();
    tracing::info!("Worker exiting");
    Ok(())
}

async fn initialize(
    targets: &mut TargetRegistry,
    plugins: &PluginRegistry,
    require_path: &str,
    constructor_args: Vec<Value>,
    plugin_names: &[String],
    context: &LoggingContext,
) -> Result<Arc<dyn Target>, RemoteError> {
    for name in plugin_names {
        let plugin = plugins.get(name).ok_or_else(|| {
            RemoteError::new("plugin_not_found", format!("no plugin named `{name}`"))
        })?;
        AssertUnwindSafe(plugin.load(targets))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(RemoteError::panicked(panic_message(payload.as_ref()))))?;
        tracing::debug!(plugin = %name, "Plugin loaded");
    }
    targets.create(require_path, constructor_args, context)
}

async fn run_method(
    target: Arc<dyn Target>,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, RemoteError> {
    AssertUnwindSafe(target.invoke(method, args))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(method, %message, "Method panicked");
            Err(RemoteError::panicked(message))
        })
}

/// Send a method's response. A result the codec refuses (e.g. an unregistered
/// revivable type) is turned into a rejection so the caller still settles.
async fn respond<W>(writer: &SharedWriter<W>, correlation_id: u64, response: WorkerResponse)
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    let error = match w.send(response).await {
        Ok(()) => return,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => e,
        Err(e) => {
            tracing::warn!(correlation_id, error = %e, "Failed to send response");
            return;
        }
    };

    tracing::warn!(correlation_id, %error, "Result could not be encoded");
    let rejection = WorkerResponse::Rejection {
        correlation_id,
        error: RemoteError::new("encode", error.to_string()),
    };
    if let Err(e) = w.send(rejection).await {
        tracing::warn!(correlation_id, error = %e, "Failed to send rejection");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker method panicked".to_string()
    }
}
