//! child-proxy: run an object in a worker process and call it like a local one.

pub mod bridge;
pub mod contract;
pub mod controller;
mod error;
mod fd_redirect;
pub mod logging;
pub mod task;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bridge::protocol::{AUTO_START, RemoteError};
pub use bridge::revive::{File, Revivable, RevivalRegistry};
pub use contract::{ArgReader, Args, Contract, Dispatch, MethodSpec, Served, encode_result};
#[doc(hidden)]
pub use contract::__private;
pub use controller::{
    Call, CommandSpawner, ConnectionState, Controller, ControllerConfig, CurrentExeSpawner,
    ExpiringCall, Init, ProcessHandle, Proxy, WorkerChannel, WorkerSpawner,
};
pub use error::ProxyError;
pub use logging::{LoggingContext, init_tracing};
pub use task::{ExpirableFuture, ExpirableTask, Task, TaskFuture};
pub use worker::{
    Plugin, PluginRegistry, Target, TargetRegistry, WorkerConfig, autostart_requested,
    run_worker, serve,
};
