//! Externally settled futures.
//!
//! A [`Task`] is split in two: the settling half is handed to whoever will
//! eventually produce the value (the controller's event loop), the awaitable
//! half to whoever waits for it. Settling consumes the task, so a task can
//! only ever be settled once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Sleep;

use crate::error::ProxyError;

type Outcome<T> = Result<T, ProxyError>;

/// Settling half of a deferred value.
#[derive(Debug)]
pub struct Task<T> {
    sender: oneshot::Sender<Outcome<T>>,
    completed: Arc<AtomicBool>,
}

impl<T> Task<T> {
    /// Create a pending task and the future that observes it.
    pub fn create() -> (Task<T>, TaskFuture<T>) {
        let (sender, receiver) = oneshot::channel();
        let completed = Arc::new(AtomicBool::new(false));
        let task = Task {
            sender,
            completed: Arc::clone(&completed),
        };
        (
            task,
            TaskFuture {
                receiver,
                completed,
            },
        )
    }

    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, error: ProxyError) {
        self.settle(Err(error));
    }

    /// True once the awaiting side has gone away (dropped or expired).
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }

    fn settle(self, outcome: Outcome<T>) {
        self.completed.store(true, Ordering::Release);
        // Nobody listening is fine: the caller stopped waiting.
        let _ = self.sender.send(outcome);
    }
}

/// Awaitable half of a [`Task`].
#[derive(Debug)]
pub struct TaskFuture<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
    completed: Arc<AtomicBool>,
}

impl<T> TaskFuture<T> {
    /// Whether the task has been resolved or rejected.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProxyError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A task whose waiter gives up after a fixed duration.
///
/// Expiry only frees the waiter: whatever feeds the task keeps running and
/// may still settle it later, to no effect.
pub struct ExpirableTask;

impl ExpirableTask {
    /// Must be called from within a Tokio runtime (the timer starts now).
    pub fn create<T>(timeout: Duration) -> (Task<T>, ExpirableFuture<T>) {
        let (task, inner) = Task::create();
        let future = ExpirableFuture {
            inner,
            timer: Box::pin(tokio::time::sleep(timeout)),
            timeout,
        };
        (task, future)
    }
}

/// Resolves to `Ok(None)` if the timeout elapses first.
#[derive(Debug)]
pub struct ExpirableFuture<T> {
    inner: TaskFuture<T>,
    timer: Pin<Box<Sleep>>,
    timeout: Duration,
}

impl<T> ExpirableFuture<T> {
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<T> Future for ExpirableFuture<T> {
    type Output = Outcome<Option<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(outcome) = Pin::new(&mut self.inner).poll(cx) {
            return Poll::Ready(outcome.map(Some));
        }
        match self.timer.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Ok(None)),
            Poll::Pending => Poll::Pending,
        }
    }
}
