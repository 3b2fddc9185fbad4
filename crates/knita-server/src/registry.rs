//! Runtimes opened through this control plane, and the operations on them.

use crate::ApiError;
use chrono::{DateTime, Utc};
use knita_executor::{stream_exec, ExecEvent, ExecutorBackend, ExecutorError};
use knita_protocol::{CloseRequest, ExecRequest, OpenRequest, OpenResponse, TransferRequest};
use knita_schema::{BuildId, RuntimeConfig, RuntimeId, TransferOpts};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// One open runtime.
pub struct RuntimeRecord {
    pub id: RuntimeId,
    pub work_directory: String,
    pub display_name: Option<String>,
    pub opened_at: DateTime<Utc>,
    /// Held for the duration of an exec, and by close.
    busy: Mutex<()>,
}

impl std::fmt::Debug for RuntimeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeRecord")
            .field("id", &self.id)
            .field("work_directory", &self.work_directory)
            .field("display_name", &self.display_name)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

/// Shared state of the control plane: the build it serves, the executor
/// backend it drives, and the runtimes currently open.
pub struct ControlPlaneState {
    build_id: BuildId,
    backend: Arc<dyn ExecutorBackend>,
    runtimes: RwLock<HashMap<RuntimeId, Arc<RuntimeRecord>>>,
    seq: AtomicU64,
}

impl ControlPlaneState {
    pub fn new(build_id: BuildId, backend: Arc<dyn ExecutorBackend>) -> Self {
        Self {
            build_id,
            backend,
            runtimes: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Open runtimes, oldest first.
    pub fn open_runtimes(&self) -> Vec<Arc<RuntimeRecord>> {
        let mut records: Vec<_> = self
            .runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|r| r.opened_at);
        records
    }

    fn lookup(&self, id: &str) -> Result<Arc<RuntimeRecord>, ApiError> {
        self.runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&RuntimeId::new(id))
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("unknown runtime: {id}")))
    }

    fn next_runtime_id(&self) -> RuntimeId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seed = format!("{}:{seq}:{nanos}", self.build_id);
        let hex = blake3::hash(seed.as_bytes()).to_hex();
        RuntimeId::new(format!("rt-{}", &hex[..16]))
    }

    pub fn open(&self, req: &OpenRequest) -> Result<OpenResponse, ApiError> {
        if req.build_id != self.build_id.as_str() {
            return Err(ApiError::forbidden(format!(
                "build id '{}' does not match this control plane",
                req.build_id
            )));
        }
        let config = RuntimeConfig::try_from(&req.opts)
            .map_err(|e| ApiError::from(ExecutorError::Config(e)))?;
        if !self.backend.supports(&config) {
            return Err(ExecutorError::BackendUnavailable(config.backend.name().to_owned()).into());
        }

        let id = self.next_runtime_id();
        let opened = self.backend.open(&id, &config)?;
        let record = Arc::new(RuntimeRecord {
            id: id.clone(),
            work_directory: opened.work_directory.to_string_lossy().into_owned(),
            display_name: config.display_name().map(str::to_owned),
            opened_at: Utc::now(),
            busy: Mutex::new(()),
        });
        self.runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&record));
        info!(
            "opened {} runtime {id} ({})",
            config.backend.name(),
            record.display_name.as_deref().unwrap_or("unnamed")
        );

        Ok(OpenResponse {
            runtime_id: id.into_inner(),
            work_directory: record.work_directory.clone(),
            system_info: opened.system_info,
        })
    }

    /// Start an exec on a worker thread and return the receiving end of its
    /// event stream. The stream always ends with exactly one `End` unless
    /// the receiver is dropped first, in which case the command is stopped.
    pub fn start_exec(&self, req: ExecRequest) -> Result<mpsc::Receiver<ExecEvent>, ApiError> {
        let record = self.lookup(&req.runtime_id)?;
        req.opts
            .validate()
            .map_err(|e| ApiError::from(ExecutorError::Config(e)))?;

        let (mut tx, rx) = mpsc::channel();
        let backend = Arc::clone(&self.backend);
        std::thread::spawn(move || {
            let _busy = record.busy.lock().unwrap_or_else(PoisonError::into_inner);
            match stream_exec(&*backend, &record.id, &req.opts, &mut tx) {
                Ok(()) => debug!("exec stream on {} complete", record.id),
                Err(e) => warn!("exec on {} abandoned: {e}", record.id),
            }
        });
        Ok(rx)
    }

    pub fn import(&self, req: &TransferRequest) -> Result<(), ApiError> {
        let record = self.lookup(&req.runtime_id)?;
        let opts = transfer_opts(req);
        self.backend.import(&record.id, &req.src_path, &opts)?;
        debug!("imported {} into {}", req.src_path, record.id);
        Ok(())
    }

    pub fn export(&self, req: &TransferRequest) -> Result<(), ApiError> {
        let record = self.lookup(&req.runtime_id)?;
        let opts = transfer_opts(req);
        self.backend.export(&record.id, &req.src_path, &opts)?;
        debug!("exported {} from {}", req.src_path, record.id);
        Ok(())
    }

    pub fn close(&self, req: &CloseRequest) -> Result<(), ApiError> {
        let id = RuntimeId::new(req.runtime_id.as_str());
        let record = self
            .runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or_else(|| ApiError::not_found(format!("unknown runtime: {id}")))?;
        self.close_record(&record)?;
        Ok(())
    }

    fn close_record(&self, record: &RuntimeRecord) -> Result<(), ExecutorError> {
        let _busy = record.busy.lock().unwrap_or_else(PoisonError::into_inner);
        self.backend.close(&record.id)?;
        let open_for = Utc::now() - record.opened_at;
        info!(
            "closed runtime {} after {}s",
            record.id,
            open_for.num_seconds()
        );
        Ok(())
    }

    /// Close every runtime still open. Failures are logged and skipped.
    /// Returns how many runtimes were closed cleanly.
    pub fn close_all(&self) -> usize {
        let records: Vec<_> = self
            .runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, record)| record)
            .collect();
        let mut closed = 0;
        for record in records {
            match self.close_record(&record) {
                Ok(()) => closed += 1,
                Err(e) => warn!("failed to close runtime {} on shutdown: {e}", record.id),
            }
        }
        closed
    }
}

fn transfer_opts(req: &TransferRequest) -> TransferOpts {
    TransferOpts::new()
        .with_dest(&req.dest_path)
        .with_excludes(req.excludes.iter().cloned())
}
