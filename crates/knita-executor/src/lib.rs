//! Reference executor for Knita runtimes.
//!
//! The [`ExecutorBackend`] trait is what a control plane drives for each
//! runtime: open a work directory, run commands while streaming their output
//! as [`ExecEvent`]s, copy files in and out, and clean up on close. The
//! [`HostBackend`] runs commands directly on the local machine in a temporary
//! directory per runtime; [`MockBackend`] records calls for tests.

pub mod backend;
pub mod host;
pub mod mock;
pub mod transfer;

pub use backend::{select_backend, stream_exec, EventSink, ExecutorBackend, OpenedRuntime};
pub use host::HostBackend;
pub use knita_protocol::ExecEvent;
pub use mock::MockBackend;
pub use transfer::{plan_transfer, transfer, TransferEntry, TransferSummary};

use knita_schema::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend '{0}' is not available on this executor")]
    BackendUnavailable(String),
    #[error("unknown runtime: {0}")]
    UnknownRuntime(String),
    #[error("failed to start '{command}': {message}")]
    SpawnFailed { command: String, message: String },
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("event consumer went away")]
    SinkClosed,
}
