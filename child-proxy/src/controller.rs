//! Controller side of the proxy: spawn, handshake, forwarding, dispose.
//!
//! One event-loop task per controller owns the worker process, the framed
//! channel and the correlation table. [`Proxy`] handles talk to it through an
//! unbounded command channel, so a call is ordered the moment it is issued.
//!
//! ```text
//! Proxy::invoke ──Command::Call──▶ event loop ──work──▶ worker
//!      ▲                               │  ◀──result/rejection──
//!      └────────── Task settled ◀──────┘
//! ```

use std::collections::VecDeque;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::ops::{ControlFlow, Deref};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{AUTO_START, CorrelationId, Inbound, WorkerRequest, WorkerResponse};
use crate::bridge::revive::RevivalRegistry;
use crate::contract::{Args, Contract};
use crate::error::ProxyError;
use crate::logging::{LoggingContext, emit_worker_log};
use crate::task::{ExpirableFuture, ExpirableTask, Task, TaskFuture};

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker with stdin and stdout piped.
    fn spawn(&self) -> io::Result<Child>;
}

/// Runs a program with [`AUTO_START`] as its first argument.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra argument passed after the sentinel.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> io::Result<Child> {
        tokio::process::Command::new(&self.program)
            .arg(AUTO_START)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker panics go to our stderr
            .kill_on_drop(true)
            .spawn()
    }
}

/// Re-executes the current binary as the worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentExeSpawner;

impl WorkerSpawner for CurrentExeSpawner {
    fn spawn(&self) -> io::Result<Child> {
        CommandSpawner::new(std::env::current_exe()?).spawn()
    }
}

/// The worker process as seen by the event loop.
pub trait ProcessHandle: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// Request termination. Consumes the handle: a process is terminated at most once.
    fn terminate(self: Box<Self>) -> io::Result<()>;
}

impl ProcessHandle for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    fn terminate(mut self: Box<Self>) -> io::Result<()> {
        self.start_kill()?;
        // Reap in the background so the worker doesn't linger as a zombie.
        tokio::spawn(async move {
            match self.wait().await {
                Ok(status) => tracing::debug!(%status, "Worker exited"),
                Err(e) => tracing::warn!(error = %e, "Failed to reap worker"),
            }
        });
        Ok(())
    }
}

/// A connected worker: its output, its input, and the process behind them.
pub struct WorkerChannel<R, W> {
    pub reader: R,
    pub writer: W,
    pub process: Box<dyn ProcessHandle>,
}

impl<R, W> WorkerChannel<R, W> {
    pub fn new(reader: R, writer: W, process: impl ProcessHandle) -> Self {
        Self {
            reader,
            writer,
            process: Box::new(process),
        }
    }
}

pub struct ControllerConfig {
    pub init_timeout: Duration,
    pub dispose_timeout: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub revivers: Arc<RevivalRegistry>,
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self {
            init_timeout: Duration::from_secs(300),
            dispose_timeout: Duration::from_secs(5),
            spawner: Arc::new(CurrentExeSpawner),
            revivers: Arc::new(RevivalRegistry::default()),
        }
    }

    /// Spawn `program` instead of re-executing the current binary.
    pub fn with_program(self, program: impl Into<PathBuf>) -> Self {
        self.with_spawner(Arc::new(CommandSpawner::new(program)))
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }

    pub fn with_revivers(mut self, revivers: Arc<RevivalRegistry>) -> Self {
        self.revivers = revivers;
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What the worker is asked to construct.
#[derive(Debug, Clone)]
pub struct Init {
    require_path: String,
    constructor_args: Args,
    plugins: Vec<String>,
    logging_context: LoggingContext,
}

impl Init {
    /// `require_path` names a target registered in the worker.
    pub fn new(require_path: impl Into<String>) -> Self {
        Self {
            require_path: require_path.into(),
            constructor_args: Args::new(),
            plugins: Vec::new(),
            logging_context: LoggingContext::from_env(),
        }
    }

    pub fn with_constructor_args(mut self, args: Args) -> Self {
        self.constructor_args = args;
        self
    }

    pub fn with_plugin(mut self, name: impl Into<String>) -> Self {
        self.plugins.push(name.into());
        self
    }

    pub fn with_plugins<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_logging_context(mut self, context: LoggingContext) -> Self {
        self.logging_context = context;
        self
    }

    fn into_request(self, revivers: &RevivalRegistry) -> Result<WorkerRequest, ProxyError> {
        let constructor_args = self.constructor_args.into_values()?;
        check_revivable(revivers, &constructor_args)?;
        Ok(WorkerRequest::Init {
            require_path: self.require_path,
            constructor_args,
            plugins: self.plugins,
            logging_context: self.logging_context,
        })
    }
}

fn check_revivable(revivers: &RevivalRegistry, values: &[Value]) -> Result<(), ProxyError> {
    values
        .iter()
        .try_for_each(|v| revivers.check(v))
        .map_err(|e| ProxyError::Encode(e.to_string()))
}

/// Lifecycle of a controller, observable through [`Proxy::state`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Initializing,
    Ready,
    /// Init failed, timed out, or the worker went away. Terminal.
    Failed(ProxyError),
    Disposing,
    Disposed,
}

struct PendingCall {
    method: &'static str,
    args: Vec<Value>,
    task: Task<Value>,
}

enum Command {
    Call(PendingCall),
    Dispose(Task<()>),
}

/// Owner of one worker. Derefs to its [`Proxy`].
///
/// Dropping the controller and every proxy cloned from it terminates the worker.
pub struct Controller<C> {
    id: Uuid,
    proxy: Proxy<C>,
}

impl<C: Contract> Controller<C> {
    /// Spawn a worker and start the handshake. Does not wait for it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create(config: &ControllerConfig, init: Init) -> Result<Self, ProxyError> {
        let init = init.into_request(&config.revivers)?;

        let mut child = config
            .spawner
            .spawn()
            .map_err(|e| ProxyError::Spawn(e.to_string()))?;
        tracing::info!(pid = ?child.id(), contract = C::NAME, "Spawned worker");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Spawn("stdout not captured".to_string()))?;

        Ok(Self::start(config, WorkerChannel::new(stdout, stdin, child), init))
    }

    /// Run the protocol over an already connected worker.
    pub fn from_transport<R, W>(
        config: &ControllerConfig,
        channel: WorkerChannel<R, W>,
        init: Init,
    ) -> Result<Self, ProxyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let init = init.into_request(&config.revivers)?;
        Ok(Self::start(config, channel, init))
    }

    fn start<R, W>(config: &ControllerConfig, channel: WorkerChannel<R, W>, init: WorkerRequest) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initializing);

        let event_loop = EventLoop {
            reader: FramedRead::new(
                channel.reader,
                JsonCodec::with_revivers(Arc::clone(&config.revivers)),
            ),
            writer: FramedWrite::new(
                channel.writer,
                JsonCodec::with_revivers(Arc::clone(&config.revivers)),
            ),
            process: Some(channel.process),
            commands: commands_rx,
            state: state_tx,
            calls: Vec::new(),
            queued: VecDeque::new(),
            dispose_waiters: Vec::new(),
            deadline: None,
            init_timeout: config.init_timeout,
            dispose_timeout: config.dispose_timeout,
        };
        let span = tracing::info_span!("controller", %id, contract = C::NAME);
        tokio::spawn(event_loop.run(init).instrument(span));

        Self {
            id,
            proxy: Proxy {
                commands: commands_tx,
                state: state_rx,
                revivers: Arc::clone(&config.revivers),
                _contract: PhantomData,
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn proxy(&self) -> &Proxy<C> {
        &self.proxy
    }
}

impl<C> Deref for Controller<C> {
    type Target = Proxy<C>;

    fn deref(&self) -> &Proxy<C> {
        &self.proxy
    }
}

/// Cloneable handle forwarding calls to a controller's worker.
pub struct Proxy<C> {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    revivers: Arc<RevivalRegistry>,
    _contract: PhantomData<fn() -> C>,
}

impl<C> Clone for Proxy<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            revivers: Arc::clone(&self.revivers),
            _contract: PhantomData,
        }
    }
}

impl<C: Contract> Proxy<C> {
    /// Forward a call. Ordered now; sent once the worker is initialized.
    pub fn invoke<R: DeserializeOwned>(&self, method: &str, args: Args) -> Call<R> {
        let (task, future) = Task::create();
        self.submit(method, args, task);
        Call {
            inner: future,
            _result: PhantomData,
        }
    }

    /// Like [`invoke`](Self::invoke), but stop waiting after `timeout`.
    ///
    /// Expiry yields `Ok(None)`; the call itself keeps running in the worker.
    pub fn invoke_expiring<R: DeserializeOwned>(
        &self,
        method: &str,
        args: Args,
        timeout: Duration,
    ) -> ExpiringCall<R> {
        let (task, future) = ExpirableTask::create(timeout);
        self.submit(method, args, task);
        ExpiringCall {
            inner: future,
            _result: PhantomData,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait for the handshake to finish.
    pub async fn wait_ready(&self) -> Result<(), ProxyError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, ConnectionState::Initializing))
            .await
            .map(|s| (*s).clone());
        let settled = match settled {
            Ok(s) => s,
            Err(_) => state.borrow().clone(),
        };
        match settled {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Failed(e) => Err(e),
            _ => Err(ProxyError::Disposed),
        }
    }

    /// Dispose the worker and terminate its process. Never fails.
    ///
    /// Calls still queued or awaiting a response are rejected with
    /// [`ProxyError::Disposed`] as soon as the dispose starts, before the
    /// worker is asked to dispose; a `result` arriving after that point is
    /// ignored. Concurrent and repeated calls share one dispose exchange.
    pub async fn dispose(&self) {
        let (task, future) = Task::create();
        if self.commands.send(Command::Dispose(task)).is_err() {
            return;
        }
        let _ = future.await;
    }

    fn submit(&self, method: &str, args: Args, task: Task<Value>) {
        let Some(declared) = C::method(method) else {
            return task.reject(ProxyError::UnknownMethod {
                contract: C::NAME,
                method: method.to_string(),
            });
        };
        if args.len() != declared.arity {
            return task.reject(ProxyError::ArityMismatch {
                method: declared.name,
                expected: declared.arity,
                actual: args.len(),
            });
        }
        let args = match args.into_values() {
            Ok(args) => args,
            Err(e) => return task.reject(e),
        };
        if let Err(e) = check_revivable(&self.revivers, &args) {
            return task.reject(e);
        }

        let call = PendingCall {
            method: declared.name,
            args,
            task,
        };
        if let Err(mpsc::error::SendError(Command::Call(call))) =
            self.commands.send(Command::Call(call))
        {
            call.task.reject(self.terminal_error());
        }
    }

    fn terminal_error(&self) -> ProxyError {
        match &*self.state.borrow() {
            ConnectionState::Failed(e) => e.clone(),
            _ => ProxyError::Disposed,
        }
    }
}

/// A forwarded call. Resolves to the decoded result.
pub struct Call<R> {
    inner: TaskFuture<Value>,
    _result: PhantomData<fn() -> R>,
}

impl<R> Call<R> {
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }
}

impl<R: DeserializeOwned> Future for Call<R> {
    type Output = Result<R, ProxyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|outcome| outcome.and_then(decode))
    }
}

/// A forwarded call the caller stops waiting on after a timeout.
pub struct ExpiringCall<R> {
    inner: ExpirableFuture<Value>,
    _result: PhantomData<fn() -> R>,
}

impl<R> ExpiringCall<R> {
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }
}

impl<R: DeserializeOwned> Future for ExpiringCall<R> {
    type Output = Result<Option<R>, ProxyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|outcome| outcome.and_then(|value| value.map(decode).transpose()))
    }
}

fn decode<R: DeserializeOwned>(value: Value) -> Result<R, ProxyError> {
    serde_json::from_value(value).map_err(|e| ProxyError::Decode(e.to_string()))
}

struct EventLoop<R, W> {
    reader: FramedRead<R, JsonCodec<Inbound<WorkerResponse>>>,
    writer: FramedWrite<W, JsonCodec<WorkerRequest>>,
    process: Option<Box<dyn ProcessHandle>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    /// Indexed by correlation id. Slots are emptied when settled, never reused.
    calls: Vec<Option<Task<Value>>>,
    /// Calls issued before the handshake finished, in issue order.
    queued: VecDeque<PendingCall>,
    dispose_waiters: Vec<Task<()>>,
    /// Handshake or dispose deadline, whichever phase we are in.
    deadline: Option<Pin<Box<Sleep>>>,
    init_timeout: Duration,
    dispose_timeout: Duration,
}

impl<R, W> EventLoop<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, init: WorkerRequest) {
        tracing::debug!("Sending init to worker");
        match self.writer.send(init).await {
            Ok(()) => {
                self.deadline = Some(Box::pin(tokio::time::sleep(self.init_timeout)));
                self.event_loop().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to send init");
                self.fail(ProxyError::WorkerExited);
            }
        }
        self.shutdown();
    }

    async fn event_loop(&mut self) {
        loop {
            let flow = tokio::select! {
                biased;

                frame = self.reader.next() => self.on_frame(frame).await,

                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => self.on_abandoned(),
                },

                () = expired(&mut self.deadline) => self.on_deadline(),
            };
            if flow.is_break() {
                break;
            }
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<io::Result<Inbound<WorkerResponse>>>,
    ) -> ControlFlow<()> {
        match frame {
            Some(Ok(Inbound::Known(message))) => self.on_message(message).await,
            Some(Ok(Inbound::Malformed {
                kind,
                correlation_id: Some(correlation_id),
                error,
            })) => {
                tracing::error!(correlation_id, %kind, %error, "Malformed response from worker");
                let error = ProxyError::Protocol(format!("malformed `{kind}` message: {error}"));
                self.settle(correlation_id, Err(error));
                ControlFlow::Continue(())
            }
            Some(Ok(Inbound::Malformed { kind, error, .. }))
                if kind == "init_failed" && self.is(ConnectionState::Initializing) =>
            {
                tracing::error!(%error, "Malformed init_failed from worker");
                self.fail(ProxyError::Protocol(format!("malformed `{kind}` message: {error}")))
            }
            Some(Ok(Inbound::Malformed { kind, error, .. })) => {
                tracing::error!(%kind, %error, "Malformed message from worker names no call, dropping");
                ControlFlow::Continue(())
            }
            Some(Ok(Inbound::Unrecognized(raw))) => {
                tracing::error!(message = %raw, "Unrecognized message from worker, dropping");
                ControlFlow::Continue(())
            }
            Some(Err(e)) if self.is(ConnectionState::Disposing) => {
                tracing::debug!(error = %e, "Worker channel error during dispose");
                self.finish_dispose()
            }
            None if self.is(ConnectionState::Disposing) => {
                tracing::debug!("Worker closed its channel during dispose");
                self.finish_dispose()
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Worker channel error");
                self.fail(ProxyError::Protocol(e.to_string()))
            }
            None => {
                tracing::warn!("Worker channel closed unexpectedly");
                self.fail(ProxyError::WorkerExited)
            }
        }
    }

    async fn on_message(&mut self, message: WorkerResponse) -> ControlFlow<()> {
        match message {
            WorkerResponse::Initialized => {
                if !self.is(ConnectionState::Initializing) {
                    tracing::debug!("Ignoring initialized outside the handshake");
                    return ControlFlow::Continue(());
                }
                tracing::info!(queued = self.queued.len(), "Worker initialized");
                self.deadline = None;
                self.state.send_replace(ConnectionState::Ready);
                while let Some(call) = self.queued.pop_front() {
                    if self.dispatch(call).await.is_break() {
                        return ControlFlow::Break(());
                    }
                }
            }
            WorkerResponse::InitFailed { error } => {
                if !self.is(ConnectionState::Initializing) {
                    tracing::warn!(%error, "Ignoring init_failed outside the handshake");
                    return ControlFlow::Continue(());
                }
                tracing::error!(%error, kind = %error.kind, "Worker failed to initialize");
                return self.fail(ProxyError::InitFailed(error));
            }
            WorkerResponse::Result {
                correlation_id,
                result,
            } => self.settle(correlation_id, Ok(result)),
            WorkerResponse::Rejection {
                correlation_id,
                error,
            } => self.settle(correlation_id, Err(ProxyError::Remote(error))),
            WorkerResponse::DisposeCompleted => {
                if self.is(ConnectionState::Disposing) {
                    tracing::debug!("Worker completed dispose");
                    return self.finish_dispose();
                }
                tracing::warn!("Ignoring unsolicited dispose_completed");
            }
            WorkerResponse::Log {
                level,
                target,
                message,
            } => emit_worker_log(level, &target, &message),
        }
        ControlFlow::Continue(())
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Call(call) => match self.phase() {
                ConnectionState::Initializing => {
                    self.queued.push_back(call);
                    ControlFlow::Continue(())
                }
                ConnectionState::Ready => self.dispatch(call).await,
                _ => {
                    call.task.reject(ProxyError::Disposed);
                    ControlFlow::Continue(())
                }
            },
            Command::Dispose(waiter) => self.on_dispose(waiter).await,
        }
    }

    async fn dispatch(&mut self, call: PendingCall) -> ControlFlow<()> {
        let PendingCall { method, args, task } = call;
        let correlation_id = self.calls.len() as CorrelationId;
        self.calls.push(Some(task));
        tracing::trace!(correlation_id, method, "Dispatching call");

        let work = WorkerRequest::Work {
            correlation_id,
            method_name: method.to_string(),
            args,
        };
        match self.writer.send(work).await {
            Ok(()) => ControlFlow::Continue(()),
            // Refused by the codec before anything was written: only this call fails.
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                if let Some(task) = self.calls.last_mut().and_then(Option::take) {
                    task.reject(ProxyError::Encode(e.to_string()));
                }
                ControlFlow::Continue(())
            }
            Err(e) => {
                tracing::error!(correlation_id, error = %e, "Failed to send call to worker");
                self.fail(ProxyError::WorkerExited)
            }
        }
    }

    fn settle(&mut self, correlation_id: CorrelationId, outcome: Result<Value, ProxyError>) {
        let task = usize::try_from(correlation_id)
            .ok()
            .and_then(|i| self.calls.get_mut(i))
            .and_then(Option::take);
        match (task, outcome) {
            (Some(task), Ok(value)) => task.resolve(value),
            (Some(task), Err(error)) => task.reject(error),
            (None, _) => {
                tracing::warn!(correlation_id, "Response for unknown or settled call, ignoring")
            }
        }
    }

    async fn on_dispose(&mut self, waiter: Task<()>) -> ControlFlow<()> {
        self.dispose_waiters.push(waiter);
        if self.is(ConnectionState::Disposing) {
            return ControlFlow::Continue(());
        }

        tracing::info!(
            outstanding = self.outstanding(),
            queued = self.queued.len(),
            "Disposing worker"
        );
        self.reject_all(&ProxyError::Disposed);
        self.state.send_replace(ConnectionState::Disposing);
        self.deadline = Some(Box::pin(tokio::time::sleep(self.dispose_timeout)));

        if let Err(e) = self.writer.send(WorkerRequest::Dispose).await {
            tracing::warn!(error = %e, "Failed to send dispose");
            return self.finish_dispose();
        }
        ControlFlow::Continue(())
    }

    fn on_deadline(&mut self) -> ControlFlow<()> {
        self.deadline = None;
        match self.phase() {
            ConnectionState::Initializing => {
                tracing::error!(timeout = ?self.init_timeout, "Worker did not initialize in time");
                self.fail(ProxyError::InitTimeout(self.init_timeout))
            }
            ConnectionState::Disposing => {
                tracing::warn!(timeout = ?self.dispose_timeout, "Worker did not complete dispose in time");
                self.finish_dispose()
            }
            _ => ControlFlow::Continue(()),
        }
    }

    /// Every handle is gone: nobody can issue or await anything new.
    fn on_abandoned(&mut self) -> ControlFlow<()> {
        tracing::debug!("All handles dropped, terminating worker");
        self.state.send_replace(ConnectionState::Disposed);
        self.reject_all(&ProxyError::Disposed);
        self.terminate();
        ControlFlow::Break(())
    }

    fn finish_dispose(&mut self) -> ControlFlow<()> {
        self.deadline = None;
        self.terminate();
        self.state.send_replace(ConnectionState::Disposed);
        for waiter in self.dispose_waiters.drain(..) {
            waiter.resolve(());
        }
        tracing::info!("Worker disposed");
        ControlFlow::Break(())
    }

    fn fail(&mut self, error: ProxyError) -> ControlFlow<()> {
        self.deadline = None;
        self.state.send_replace(ConnectionState::Failed(error.clone()));
        self.reject_all(&error);
        self.terminate();
        for waiter in self.dispose_waiters.drain(..) {
            waiter.resolve(());
        }
        ControlFlow::Break(())
    }

    fn reject_all(&mut self, error: &ProxyError) {
        for call in self.queued.drain(..) {
            call.task.reject(error.clone());
        }
        for task in self.calls.iter_mut().filter_map(Option::take) {
            task.reject(error.clone());
        }
    }

    fn terminate(&mut self) {
        if let Some(process) = self.process.take() {
            let pid = process.pid();
            match process.terminate() {
                Ok(()) => tracing::debug!(?pid, "Terminated worker"),
                Err(e) => tracing::warn!(?pid, error = %e, "Failed to terminate worker"),
            }
        }
    }

    /// Settle whatever raced in after the loop stopped.
    fn shutdown(&mut self) {
        self.commands.close();
        let error = match self.phase() {
            ConnectionState::Failed(e) => e,
            _ => ProxyError::Disposed,
        };
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Call(call) => call.task.reject(error.clone()),
                Command::Dispose(waiter) => waiter.resolve(()),
            }
        }
        self.terminate();
    }

    fn phase(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn is(&self, state: ConnectionState) -> bool {
        *self.state.borrow() == state
    }

    fn outstanding(&self) -> usize {
        self.calls.iter().filter(|c| c.is_some()).count()
    }
}

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RemoteError;
    use crate::bridge::revive::File;
    use crate::testing::{CALCULATOR, Calculator, CalculatorClient, worker_config};
    use crate::worker::serve;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// Counts terminations instead of killing anything.
    struct CountingProcess(Arc<AtomicUsize>);

    impl ProcessHandle for CountingProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn terminate(self: Box<Self>) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// A worker driven step by step from the test.
    struct FakeWorker {
        reader: FramedRead<ReadHalf<DuplexStream>, JsonCodec<WorkerRequest>>,
        writer: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Value>>,
    }

    impl FakeWorker {
        async fn recv(&mut self) -> WorkerRequest {
            self.reader.next().await.unwrap().unwrap()
        }

        async fn send(&mut self, value: Value) {
            self.writer.send(value).await.unwrap();
        }

        async fn handshake(&mut self) {
            assert!(matches!(self.recv().await, WorkerRequest::Init { .. }));
            self.send(json!({"kind": "initialized"})).await;
        }
    }

    fn connect(
        config: &ControllerConfig,
        init: Init,
    ) -> (Controller<Calculator>, DuplexStream, Arc<AtomicUsize>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        let kills = Arc::new(AtomicUsize::new(0));
        let channel = WorkerChannel::new(reader, writer, CountingProcess(Arc::clone(&kills)));
        let controller = Controller::from_transport(config, channel, init).unwrap();
        (controller, theirs, kills)
    }

    fn in_process(init: Init) -> (Controller<Calculator>, Arc<AtomicUsize>) {
        let (controller, worker_io, kills) = connect(&ControllerConfig::default(), init);
        let (reader, writer) = tokio::io::split(worker_io);
        tokio::spawn(serve(reader, writer, worker_config()));
        (controller, kills)
    }

    fn scripted(config: &ControllerConfig) -> (Controller<Calculator>, FakeWorker, Arc<AtomicUsize>) {
        let (controller, worker_io, kills) = connect(config, Init::new(CALCULATOR));
        let (reader, writer) = tokio::io::split(worker_io);
        let worker = FakeWorker {
            reader: FramedRead::new(reader, JsonCodec::new()),
            writer: FramedWrite::new(writer, JsonCodec::new()),
        };
        (controller, worker, kills)
    }

    async fn eventually(kills: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if kills.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(kills.load(Ordering::SeqCst), expected);
    }

    #[tokio::test]
    async fn calls_round_trip_through_worker() {
        let (calc, _) = in_process(Init::new(CALCULATOR));

        assert_eq!(calc.add(2, 3).await, Ok(5));
        assert_eq!(calc.wait_ready().await, Ok(()));
        assert_eq!(calc.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn constructor_args_are_forwarded() {
        let init = Init::new(CALCULATOR).with_constructor_args(Args::new().arg(&10));
        let (calc, _) = in_process(init);

        assert_eq!(calc.offset().await, Ok(10));
    }

    #[tokio::test]
    async fn remote_rejection_keeps_message() {
        let (calc, _) = in_process(Init::new(CALCULATOR));

        let err = calc.fail("boom".to_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err, ProxyError::Remote(RemoteError::failed("boom")));
    }

    #[tokio::test]
    async fn panics_become_rejections() {
        let (calc, _) = in_process(Init::new(CALCULATOR));

        let err = calc.explode("kaboom".to_string()).await.unwrap_err();
        assert_eq!(err.remote().map(|e| e.kind.as_str()), Some("panic"));
        assert_eq!(calc.add(1, 1).await, Ok(2));
    }

    #[tokio::test]
    async fn file_values_round_trip() {
        let (calc, _) = in_process(Init::new(CALCULATOR));

        let renamed = calc
            .rename(File::new("a.js", "x"), "b.js".to_string())
            .await
            .unwrap();
        assert_eq!(renamed, File::new("b.js", "x"));
    }

    #[tokio::test]
    async fn calls_before_handshake_keep_issue_order() {
        let (calc, mut worker, _) = scripted(&ControllerConfig::default());

        let calls: Vec<_> = (0..5).map(|i| calc.add(i, i)).collect();
        worker.handshake().await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let WorkerRequest::Work {
                correlation_id,
                method_name,
                args,
            } = worker.recv().await
            else {
                panic!("expected work");
            };
            assert_eq!(method_name, "add");
            assert_eq!(args, vec![json!(i), json!(i)]);
            ids.push(correlation_id);
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);

        // Answer out of order; each call still gets its own result.
        for id in ids.iter().rev() {
            worker
                .send(json!({"kind": "result", "correlation_id": id, "result": id * 2}))
                .await;
        }
        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await, Ok(i as i64 * 2));
        }
    }

    #[tokio::test]
    async fn unrecognized_message_settles_nothing() {
        let (calc, mut worker, _) = scripted(&ControllerConfig::default());
        worker.handshake().await;

        let call = calc.add(1, 2);
        assert!(matches!(worker.recv().await, WorkerRequest::Work { correlation_id: 0, .. }));

        worker.send(json!({"kind": "progress", "percent": 50})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!call.is_completed());
        assert_eq!(calc.state(), ConnectionState::Ready);

        worker
            .send(json!({"kind": "result", "correlation_id": 0, "result": 3}))
            .await;
        assert_eq!(call.await, Ok(3));
    }

    #[tokio::test]
    async fn malformed_response_rejects_its_call() {
        let (calc, mut worker, kills) = scripted(&ControllerConfig::default());
        worker.handshake().await;

        let first = calc.add(1, 2);
        let second = calc.add(3, 4);
        worker.recv().await;
        worker.recv().await;

        worker
            .send(json!({"kind": "rejection", "correlation_id": 0, "error": "boom"}))
            .await;
        let err = tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .expect("malformed rejection left the call hanging")
            .unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(ref m) if m.contains("rejection")), "{err:?}");

        // Only the named call fails; the connection stays usable.
        assert_eq!(calc.state(), ConnectionState::Ready);
        worker
            .send(json!({"kind": "result", "correlation_id": 1, "result": 7}))
            .await;
        assert_eq!(second.await, Ok(7));
        assert_eq!(kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_init_failed_fails_handshake() {
        let (calc, mut worker, kills) = scripted(&ControllerConfig::default());
        assert!(matches!(worker.recv().await, WorkerRequest::Init { .. }));

        worker
            .send(json!({"kind": "init_failed", "error": "no such module"}))
            .await;
        let err = calc.wait_ready().await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)), "{err:?}");
        eventually(&kills, 1).await;
    }

    #[tokio::test]
    async fn unknown_correlation_ids_are_ignored() {
        let (calc, mut worker, _) = scripted(&ControllerConfig::default());
        worker.handshake().await;

        let call = calc.add(1, 2);
        worker.recv().await;
        worker
            .send(json!({"kind": "result", "correlation_id": 42, "result": 0}))
            .await;
        worker
            .send(json!({"kind": "result", "correlation_id": 0, "result": 3}))
            .await;
        // A second answer for an already settled call.
        worker
            .send(json!({"kind": "rejection", "correlation_id": 0, "error": {"kind": "error", "message": "late"}}))
            .await;

        assert_eq!(call.await, Ok(3));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calc.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn dispose_terminates_exactly_once() {
        let (calc, kills) = in_process(Init::new(CALCULATOR));
        calc.wait_ready().await.unwrap();

        calc.dispose().await;
        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert_eq!(calc.state(), ConnectionState::Disposed);

        calc.dispose().await;
        assert_eq!(kills.load(Ordering::SeqCst), 1);

        assert_eq!(calc.add(1, 2).await, Err(ProxyError::Disposed));
    }

    #[tokio::test]
    async fn concurrent_dispose_shares_one_exchange() {
        let (calc, mut worker, kills) = scripted(&ControllerConfig::default());
        worker.handshake().await;

        let disposing = async {
            tokio::join!(calc.dispose(), calc.dispose());
        };
        let responding = async {
            assert_eq!(worker.recv().await, WorkerRequest::Dispose);
            worker.send(json!({"kind": "dispose_completed"})).await;
            // The controller hangs up after the single exchange.
            assert!(worker.reader.next().await.is_none());
        };
        tokio::join!(disposing, responding);

        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispose_timeout_still_terminates() {
        let config = ControllerConfig::new().with_dispose_timeout(Duration::from_millis(50));
        let (calc, mut worker, kills) = scripted(&config);
        worker.handshake().await;

        // The worker never answers dispose.
        calc.dispose().await;

        assert_eq!(worker.recv().await, WorkerRequest::Dispose);
        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert_eq!(calc.state(), ConnectionState::Disposed);
    }

    #[tokio::test]
    async fn dispose_rejects_outstanding_calls() {
        let (calc, mut worker, kills) = scripted(&ControllerConfig::default());
        worker.handshake().await;

        let call = calc.add(1, 2);
        worker.recv().await;

        let disposing = calc.dispose();
        let responding = async {
            assert_eq!(worker.recv().await, WorkerRequest::Dispose);
            // Too late: the call was rejected when the dispose started.
            worker
                .send(json!({"kind": "result", "correlation_id": 0, "result": 3}))
                .await;
            worker.send(json!({"kind": "dispose_completed"})).await;
        };
        tokio::join!(disposing, responding);

        assert_eq!(call.await, Err(ProxyError::Disposed));
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_timeout_rejects_calls() {
        let config = ControllerConfig::new().with_init_timeout(Duration::from_millis(50));
        let (calc, _worker, kills) = scripted(&config);

        let timeout = ProxyError::InitTimeout(Duration::from_millis(50));
        assert_eq!(calc.add(1, 2).await, Err(timeout.clone()));
        assert_eq!(calc.state(), ConnectionState::Failed(timeout.clone()));
        assert_eq!(kills.load(Ordering::SeqCst), 1);

        assert_eq!(calc.add(3, 4).await, Err(timeout.clone()));
        assert_eq!(calc.wait_ready().await, Err(timeout));
    }

    #[tokio::test]
    async fn init_failure_rejects_queued_calls() {
        let (calc, kills) = in_process(Init::new("missing"));

        let err = calc.add(1, 2).await.unwrap_err();
        assert!(matches!(&err, ProxyError::InitFailed(e) if e.kind == "target_not_found"));
        assert_eq!(calc.wait_ready().await, Err(err));
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_plugin_fails_init() {
        let (calc, _) = in_process(Init::new(CALCULATOR).with_plugin("nope"));

        let err = calc.wait_ready().await.unwrap_err();
        assert_eq!(err.remote().map(|e| e.kind.as_str()), Some("plugin_not_found"));
    }

    #[tokio::test]
    async fn plugins_register_targets() {
        let (calc, _) = in_process(Init::new("scaled").with_plugins(["scaled"]));

        assert_eq!(calc.offset().await, Ok(100));
    }

    #[tokio::test]
    async fn worker_exit_rejects_outstanding_calls() {
        let (calc, mut worker, kills) = scripted(&ControllerConfig::default());
        worker.handshake().await;

        let call = calc.add(1, 2);
        worker.recv().await;
        drop(worker);

        assert_eq!(call.await, Err(ProxyError::WorkerExited));
        assert_eq!(calc.state(), ConnectionState::Failed(ProxyError::WorkerExited));
        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert_eq!(calc.add(1, 2).await, Err(ProxyError::WorkerExited));
    }

    #[tokio::test]
    async fn expiring_call_stops_waiting() {
        let (calc, _) = in_process(Init::new(CALCULATOR));

        let late = calc
            .invoke_expiring::<String>(
                "delayed",
                Args::new().arg(&5_000u64).arg("late"),
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(late, Ok(None));

        let quick = calc
            .invoke_expiring::<String>(
                "delayed",
                Args::new().arg(&0u64).arg("quick"),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(quick, Ok(Some("quick".to_string())));
    }

    #[tokio::test]
    async fn invalid_calls_reject_without_reaching_worker() {
        let (calc, _) = in_process(Init::new(CALCULATOR));

        let err = calc.invoke::<i64>("divide", Args::new()).await.unwrap_err();
        assert_eq!(
            err,
            ProxyError::UnknownMethod {
                contract: "Calculator",
                method: "divide".to_string()
            }
        );

        let err = calc.invoke::<i64>("add", Args::new().arg(&1)).await.unwrap_err();
        assert_eq!(
            err,
            ProxyError::ArityMismatch {
                method: "add",
                expected: 2,
                actual: 1
            }
        );

        let unknown_type = json!({"__type": "Mutant", "id": 1});
        let err = calc
            .invoke::<File>("rename", Args::new().arg(&unknown_type).arg("b.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Encode(_)), "{err:?}");
    }

    #[tokio::test]
    async fn result_of_wrong_type_fails_to_decode() {
        let (calc, _) = in_process(Init::new(CALCULATOR));

        let err = calc
            .invoke::<i64>("delayed", Args::new().arg(&0u64).arg("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Decode(_)), "{err:?}");
    }

    #[tokio::test]
    async fn dropping_every_handle_terminates_worker() {
        let (calc, _worker, kills) = scripted(&ControllerConfig::default());
        let proxy = calc.proxy().clone();

        drop(calc);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kills.load(Ordering::SeqCst), 0);

        drop(proxy);
        eventually(&kills, 1).await;
    }

    #[test]
    fn init_refuses_unencodable_constructor_args() {
        let revivers = RevivalRegistry::default();
        let init = Init::new(CALCULATOR).with_constructor_args(Args::from(vec![json!({"__type": "Mutant"})]));
        assert!(matches!(init.into_request(&revivers), Err(ProxyError::Encode(_))));
    }

    #[test]
    fn config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.init_timeout, Duration::from_secs(300));
        assert_eq!(config.dispose_timeout, Duration::from_secs(5));
    }
}
