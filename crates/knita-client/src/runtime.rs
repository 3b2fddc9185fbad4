use crate::control::ControlPlane;
use crate::exec::{demux, ExecOutcome, ExecOutput, ExecSinks};
use crate::{Error, TransportError};
use knita_protocol::{CloseRequest, ExecRequest, OpenResponse, TransferRequest};
use knita_schema::{ExecOpts, RuntimeId, SystemInfo, TransferOpts};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Open,
    Closed,
}

/// Handle to one remote runtime.
///
/// Calls on a handle are serialized: the state lock is held for the whole
/// call, so a shared `&Runtime` never has two commands in flight. Distinct
/// handles are independent.
pub struct Runtime {
    id: RuntimeId,
    work_directory: String,
    system_info: SystemInfo,
    plane: Arc<dyn ControlPlane>,
    state: Mutex<RuntimeState>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("work_directory", &self.work_directory)
            .field("system_info", &self.system_info)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub(crate) fn new(opened: OpenResponse, plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            id: RuntimeId::new(opened.runtime_id),
            work_directory: opened.work_directory,
            system_info: opened.system_info,
            plane,
            state: Mutex::new(RuntimeState::Open),
        }
    }

    pub fn id(&self) -> &RuntimeId {
        &self.id
    }

    /// Absolute path of the runtime's working directory on the executor.
    pub fn work_directory(&self) -> &str {
        &self.work_directory
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }

    pub fn state(&self) -> RuntimeState {
        *self.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RuntimeState::Closed
    }

    /// Join `rel` onto the remote work directory.
    ///
    /// Pure string manipulation using `/`: `.` components are dropped and
    /// `..` never climbs above the work directory.
    pub fn work_directory_join(&self, rel: &str) -> String {
        join_remote(&self.work_directory, rel)
    }

    /// Run a command, forwarding its output to `sinks` as it arrives.
    ///
    /// Succeeds only when the command exits with code zero.
    pub fn exec(&self, opts: &ExecOpts, mut sinks: ExecSinks<'_>) -> Result<ExecOutcome, Error> {
        let _guard = self.enter("exec")?;
        opts.validate()?;
        debug!("exec on {}: {}", self.id, opts.command_line());
        let events = self.plane.exec(&ExecRequest {
            runtime_id: self.id.to_string(),
            opts: opts.clone(),
        })?;
        demux(events, &mut sinks)
    }

    /// Run a command and capture its output. A non-zero exit code is part of
    /// the returned value; remote and protocol failures are still errors.
    pub fn exec_output(&self, opts: &ExecOpts) -> Result<ExecOutput, Error> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = match self.exec(opts, ExecSinks::new(&mut stdout, &mut stderr)) {
            Ok(outcome) => outcome.exit_code,
            Err(Error::ExecExit { exit_code }) => exit_code,
            Err(e) => return Err(e),
        };
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Copy files matching `src` from the build's local directory into the runtime.
    pub fn import(&self, src: &str, opts: &TransferOpts) -> Result<(), Error> {
        let _guard = self.enter("import")?;
        let request = self.transfer_request(src, opts)?;
        debug!("import on {}: {src} -> {:?}", self.id, opts.dest);
        self.plane
            .import(&request)
            .map_err(|e| transfer_error("import", e))
    }

    /// Copy files matching `src` from the runtime back to the build's local directory.
    pub fn export(&self, src: &str, opts: &TransferOpts) -> Result<(), Error> {
        let _guard = self.enter("export")?;
        let request = self.transfer_request(src, opts)?;
        debug!("export on {}: {src} -> {:?}", self.id, opts.dest);
        self.plane
            .export(&request)
            .map_err(|e| transfer_error("export", e))
    }

    /// Release the runtime. The handle is closed afterwards even if the
    /// control plane reports a failure; closing twice is an error.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.enter("close")?;
        *state = RuntimeState::Closed;
        info!("closing runtime {}", self.id);
        self.plane.close(&CloseRequest {
            runtime_id: self.id.to_string(),
        })?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, RuntimeState>, Error> {
        let guard = self.lock();
        if *guard == RuntimeState::Closed {
            return Err(Error::InvalidState {
                runtime_id: self.id.to_string(),
                operation,
            });
        }
        Ok(guard)
    }

    fn transfer_request(&self, src: &str, opts: &TransferOpts) -> Result<TransferRequest, Error> {
        opts.validate(src)?;
        Ok(TransferRequest {
            runtime_id: self.id.to_string(),
            src_path: src.to_owned(),
            dest_path: opts.dest.clone(),
            excludes: opts.excludes.clone(),
        })
    }
}

fn transfer_error(operation: &'static str, err: TransportError) -> Error {
    match err {
        TransportError::Rejected { message, .. } => Error::Transfer { operation, message },
        other => Error::Transport(other),
    }
}

fn join_remote(base: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in rel.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        return base.to_owned();
    }
    format!("{}/{}", base.trim_end_matches('/'), parts.join("/"))
}
