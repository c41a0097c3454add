//! IPC bridge for controller-worker communication.
//!
//! - **protocol**: Message types (WorkerRequest/WorkerResponse, RemoteError)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **revive**: typed envelopes for structured values (File, ...)

pub mod codec;
pub mod protocol;
pub mod revive;
