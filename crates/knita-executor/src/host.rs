use crate::backend::{EventSink, ExecutorBackend, OpenedRuntime};
use crate::transfer::transfer;
use crate::ExecutorError;
use knita_protocol::ExecEvent;
use knita_schema::{Backend, ExecOpts, RuntimeConfig, RuntimeId, SystemInfo, TransferOpts};
use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tempfile::TempDir;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 8 * 1024;

/// Runs commands directly on this machine, one temporary directory per runtime.
pub struct HostBackend {
    local_root: PathBuf,
    scratch_root: PathBuf,
    runtimes: Mutex<HashMap<RuntimeId, Arc<TempDir>>>,
}

impl HostBackend {
    pub fn new(local_root: &Path) -> Self {
        Self {
            local_root: local_root.to_path_buf(),
            scratch_root: std::env::temp_dir(),
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Create runtime work directories below `root` instead of the system temp dir.
    #[must_use]
    pub fn with_scratch_root(mut self, root: &Path) -> Self {
        self.scratch_root = root.to_path_buf();
        self
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RuntimeId, Arc<TempDir>>> {
        self.runtimes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn work_dir(&self, id: &RuntimeId) -> Result<Arc<TempDir>, ExecutorError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownRuntime(id.to_string()))
    }
}

impl ExecutorBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn supports(&self, config: &RuntimeConfig) -> bool {
        matches!(config.backend, Backend::Host)
    }

    fn open(&self, id: &RuntimeId, config: &RuntimeConfig) -> Result<OpenedRuntime, ExecutorError> {
        if !self.supports(config) {
            return Err(ExecutorError::BackendUnavailable(
                config.backend.name().to_owned(),
            ));
        }
        std::fs::create_dir_all(&self.scratch_root)?;
        let dir = tempfile::Builder::new()
            .prefix("knita-host-")
            .tempdir_in(&self.scratch_root)?;
        let work_directory = dir.path().to_path_buf();
        self.lock().insert(id.clone(), Arc::new(dir));
        info!("host runtime {id} opened in {}", work_directory.display());
        Ok(OpenedRuntime {
            work_directory,
            system_info: SystemInfo::current(),
        })
    }

    fn exec(
        &self,
        id: &RuntimeId,
        opts: &ExecOpts,
        sink: &mut dyn EventSink,
    ) -> Result<i32, ExecutorError> {
        opts.validate()?;
        let dir = self.work_dir(id)?;
        debug!("host exec on {id}: {}", opts.command_line());

        let mut child = Command::new(&opts.name)
            .args(&opts.args)
            .envs(opts.env_pairs())
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed {
                command: opts.name.clone(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel::<ExecEvent>();

        let streamed = thread::scope(|s| {
            if let Some(out) = stdout {
                let tx = tx.clone();
                s.spawn(move || pump(out, &tx, |data| ExecEvent::Stdout { data }));
            }
            if let Some(err) = stderr {
                let tx = tx.clone();
                s.spawn(move || pump(err, &tx, |data| ExecEvent::Stderr { data }));
            }
            drop(tx);

            let forwarded = forward(sink, rx);
            if let Err(e) = &forwarded {
                // The pumps only finish once the pipes close.
                warn!("killing {} on {id}: {e}", opts.name);
                let _ = child.kill();
            }
            forwarded
        });

        if let Err(e) = streamed {
            let _ = child.wait();
            return Err(e);
        }
        let status = child.wait()?;
        Ok(exit_code(status))
    }

    fn import(&self, id: &RuntimeId, src: &str, opts: &TransferOpts) -> Result<(), ExecutorError> {
        let dir = self.work_dir(id)?;
        transfer(&self.local_root, dir.path(), src, opts)?;
        Ok(())
    }

    fn export(&self, id: &RuntimeId, src: &str, opts: &TransferOpts) -> Result<(), ExecutorError> {
        let dir = self.work_dir(id)?;
        transfer(dir.path(), &self.local_root, src, opts)?;
        Ok(())
    }

    fn close(&self, id: &RuntimeId) -> Result<(), ExecutorError> {
        let removed = self
            .lock()
            .remove(id)
            .ok_or_else(|| ExecutorError::UnknownRuntime(id.to_string()))?;
        // The directory is deleted once the last in-flight call lets go of it.
        drop(removed);
        info!("host runtime {id} closed");
        Ok(())
    }
}

fn forward(sink: &mut dyn EventSink, rx: mpsc::Receiver<ExecEvent>) -> Result<(), ExecutorError> {
    sink.send(ExecEvent::Start)?;
    for event in rx {
        sink.send(event)?;
    }
    Ok(())
}

/// Forward everything read from `reader` as events until EOF.
fn pump(mut reader: impl Read, tx: &mpsc::Sender<ExecEvent>, wrap: fn(Vec<u8>) -> ExecEvent) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("output pipe closed: {e}");
                return;
            }
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::stream_exec;
    use knita_schema::DockerOpts;
    use std::fs;

    fn backend(local: &Path, scratch: &Path) -> HostBackend {
        HostBackend::new(local).with_scratch_root(scratch)
    }

    fn collect(events: &[ExecEvent], stdout: bool) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Stdout { data } if stdout => Some(data.clone()),
                ExecEvent::Stderr { data } if !stdout => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn open_creates_work_dir_and_close_removes_it() {
        let local = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let host = backend(local.path(), scratch.path());
        let id = RuntimeId::new("rt-1");
        let opened = host.open(&id, &RuntimeConfig::host()).unwrap();
        assert!(opened.work_directory.is_dir());
        assert!(opened.work_directory.starts_with(scratch.path()));
        assert!(!opened.system_info.os.is_empty());

        host.close(&id).unwrap();
        assert!(!opened.work_directory.exists());
        assert!(matches!(host.close(&id), Err(ExecutorError::UnknownRuntime(_))));
    }

    #[test]
    fn docker_is_unavailable() {
        let local = tempfile::tempdir().unwrap();
        let host = HostBackend::new(local.path());
        let err = host
            .open(
                &RuntimeId::new("rt"),
                &RuntimeConfig::docker(DockerOpts::new("alpine")),
            )
            .unwrap_err();
        assert!(matches!(err, ExecutorError::BackendUnavailable(ref b) if b == "docker"));
    }

    #[test]
    fn exec_streams_output_and_exit_code() {
        let local = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let host = backend(local.path(), scratch.path());
        let id = RuntimeId::new("rt-1");
        host.open(&id, &RuntimeConfig::host()).unwrap();

        let mut events = Vec::new();
        let opts = ExecOpts::new("sh")
            .arg("-c")
            .arg("printf out; printf err >&2; exit 3");
        stream_exec(&host, &id, &opts, &mut events).unwrap();

        assert_eq!(events.first(), Some(&ExecEvent::Start));
        assert_eq!(events.last(), Some(&ExecEvent::exited(3)));
        assert_eq!(collect(&events, true), b"out");
        assert_eq!(collect(&events, false), b"err");
    }

    #[test]
    fn exec_runs_in_work_dir_with_env_overrides() {
        let local = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let host = backend(local.path(), scratch.path());
        let id = RuntimeId::new("rt-1");
        let opened = host.open(&id, &RuntimeConfig::host()).unwrap();

        let mut events = Vec::new();
        let opts = ExecOpts::new("sh")
            .arg("-c")
            .arg("pwd; printf %s \"$GREETING\"")
            .env("GREETING", "hello");
        let code = host.exec(&id, &opts, &mut events).unwrap();
        assert_eq!(code, 0);

        let out = String::from_utf8(collect(&events, true)).unwrap();
        let mut lines = out.lines();
        let pwd = fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, fs::canonicalize(&opened.work_directory).unwrap());
        assert_eq!(lines.next(), Some("hello"));
    }

    #[test]
    fn spawn_failure_ends_with_error() {
        let local = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let host = backend(local.path(), scratch.path());
        let id = RuntimeId::new("rt-1");
        host.open(&id, &RuntimeConfig::host()).unwrap();

        let mut events = Vec::new();
        stream_exec(
            &host,
            &id,
            &ExecOpts::new("knita-definitely-not-a-command"),
            &mut events,
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ExecEvent::End { error, .. } if error.contains("failed to start")
        ));
    }

    #[test]
    fn import_then_export_roundtrip() {
        let local = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        fs::create_dir_all(local.path().join("src")).unwrap();
        fs::write(local.path().join("src/input.txt"), "data").unwrap();

        let host = backend(local.path(), scratch.path());
        let id = RuntimeId::new("rt-1");
        let opened = host.open(&id, &RuntimeConfig::host()).unwrap();

        host.import(&id, "src/input.txt", &TransferOpts::new()).unwrap();
        assert_eq!(
            fs::read_to_string(opened.work_directory.join("src/input.txt")).unwrap(),
            "data"
        );

        let mut events = Vec::new();
        let opts = ExecOpts::new("sh")
            .arg("-c")
            .arg("mkdir -p out && tr a-z A-Z < src/input.txt > out/result.txt");
        assert_eq!(host.exec(&id, &opts, &mut events).unwrap(), 0);

        host.export(&id, "out/", &TransferOpts::new().with_dest("results/"))
            .unwrap();
        assert_eq!(
            fs::read_to_string(local.path().join("results/result.txt")).unwrap(),
            "DATA"
        );
    }

    #[test]
    fn unknown_runtime_is_reported() {
        let local = tempfile::tempdir().unwrap();
        let host = HostBackend::new(local.path());
        let mut events = Vec::new();
        assert!(matches!(
            host.exec(&RuntimeId::new("nope"), &ExecOpts::new("true"), &mut events),
            Err(ExecutorError::UnknownRuntime(_))
        ));
    }

    struct ClosedSink;

    impl EventSink for ClosedSink {
        fn send(&mut self, _event: ExecEvent) -> Result<(), ExecutorError> {
            Err(ExecutorError::SinkClosed)
        }
    }

    #[test]
    fn closed_sink_kills_the_command() {
        let local = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let host = backend(local.path(), scratch.path());
        let id = RuntimeId::new("rt-1");
        host.open(&id, &RuntimeConfig::host()).unwrap();

        let started = std::time::Instant::now();
        let result = host.exec(&id, &ExecOpts::new("sleep").arg("30"), &mut ClosedSink);
        assert!(matches!(result, Err(ExecutorError::SinkClosed)));
        assert!(started.elapsed() < std::time::Duration::from_secs(20));
    }
}
