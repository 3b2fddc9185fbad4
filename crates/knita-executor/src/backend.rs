use crate::ExecutorError;
use knita_protocol::ExecEvent;
use knita_schema::{ExecOpts, RuntimeConfig, RuntimeId, SystemInfo, TransferOpts};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::debug;

/// What a backend reports for a freshly opened runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRuntime {
    pub work_directory: PathBuf,
    pub system_info: SystemInfo,
}

/// Receiver of exec events, in the order they are produced.
pub trait EventSink {
    fn send(&mut self, event: ExecEvent) -> Result<(), ExecutorError>;
}

impl EventSink for Vec<ExecEvent> {
    fn send(&mut self, event: ExecEvent) -> Result<(), ExecutorError> {
        self.push(event);
        Ok(())
    }
}

impl EventSink for mpsc::Sender<ExecEvent> {
    fn send(&mut self, event: ExecEvent) -> Result<(), ExecutorError> {
        mpsc::Sender::send(self, event).map_err(|_| ExecutorError::SinkClosed)
    }
}

pub trait ExecutorBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this backend can host runtimes with the given configuration.
    fn supports(&self, config: &RuntimeConfig) -> bool;

    fn open(&self, id: &RuntimeId, config: &RuntimeConfig)
        -> Result<OpenedRuntime, ExecutorError>;

    /// Run a command to completion. Emits `Start` once the command is running,
    /// then its output; returns the exit code. `End` is left to the caller.
    fn exec(
        &self,
        id: &RuntimeId,
        opts: &ExecOpts,
        sink: &mut dyn EventSink,
    ) -> Result<i32, ExecutorError>;

    /// Copy from the build's local directory into the runtime.
    fn import(
        &self,
        id: &RuntimeId,
        src: &str,
        opts: &TransferOpts,
    ) -> Result<(), ExecutorError>;

    /// Copy from the runtime back to the build's local directory.
    fn export(
        &self,
        id: &RuntimeId,
        src: &str,
        opts: &TransferOpts,
    ) -> Result<(), ExecutorError>;

    fn close(&self, id: &RuntimeId) -> Result<(), ExecutorError>;
}

/// Run `opts` on `backend` and terminate the stream with exactly one `End`.
///
/// Failures to run the command become an `End` carrying the error text.
/// Returns the error only when the sink itself is gone.
pub fn stream_exec(
    backend: &dyn ExecutorBackend,
    id: &RuntimeId,
    opts: &ExecOpts,
    sink: &mut dyn EventSink,
) -> Result<(), ExecutorError> {
    let end = match backend.exec(id, opts, sink) {
        Ok(code) => {
            debug!("{} exited with {code} on {id}", opts.name);
            ExecEvent::exited(code)
        }
        Err(ExecutorError::SinkClosed) => return Err(ExecutorError::SinkClosed),
        Err(e) => {
            debug!("{} failed on {id}: {e}", opts.name);
            ExecEvent::failed(e.to_string())
        }
    };
    sink.send(end)
}

/// Backend by name. `local_root` is the build's working directory that
/// import reads from and export writes to.
pub fn select_backend(
    name: &str,
    local_root: &Path,
) -> Result<Box<dyn ExecutorBackend>, ExecutorError> {
    match name {
        "host" => Ok(Box::new(crate::host::HostBackend::new(local_root))),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(ExecutorError::BackendUnavailable(other.to_owned())),
    }
}
