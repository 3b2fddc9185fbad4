use crate::backend::{EventSink, ExecutorBackend, OpenedRuntime};
use crate::ExecutorError;
use knita_protocol::ExecEvent;
use knita_schema::{ExecOpts, RuntimeConfig, RuntimeId, SystemInfo, TransferOpts};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Backend that runs nothing: every command echoes its command line and
/// exits 0, transfers are recorded.
pub struct MockBackend {
    state: Mutex<HashMap<RuntimeId, Vec<String>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations recorded for `id`, e.g. `exec make all` or `import src -> dst`.
    pub fn history(&self, id: &RuntimeId) -> Option<Vec<String>> {
        self.lock().get(id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RuntimeId, Vec<String>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, id: &RuntimeId, entry: String) -> Result<(), ExecutorError> {
        let mut state = self.lock();
        state
            .get_mut(id)
            .ok_or_else(|| ExecutorError::UnknownRuntime(id.to_string()))?
            .push(entry);
        Ok(())
    }
}

impl ExecutorBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports(&self, _config: &RuntimeConfig) -> bool {
        true
    }

    fn open(&self, id: &RuntimeId, _config: &RuntimeConfig) -> Result<OpenedRuntime, ExecutorError> {
        let mut state = self.lock();
        state.insert(id.clone(), Vec::new());
        Ok(OpenedRuntime {
            work_directory: PathBuf::from(format!("/mock/{id}")),
            system_info: SystemInfo {
                os: "linux".to_owned(),
                arch: "amd64".to_owned(),
                total_cpu_cores: 1,
                total_memory: 1 << 30,
            },
        })
    }

    fn exec(
        &self,
        id: &RuntimeId,
        opts: &ExecOpts,
        sink: &mut dyn EventSink,
    ) -> Result<i32, ExecutorError> {
        opts.validate()?;
        let line = opts.command_line();
        self.record(id, format!("exec {line}"))?;
        sink.send(ExecEvent::Start)?;
        sink.send(ExecEvent::stdout(format!("mock-exec: {line}\n")))?;
        Ok(0)
    }

    fn import(&self, id: &RuntimeId, src: &str, opts: &TransferOpts) -> Result<(), ExecutorError> {
        opts.validate(src)?;
        self.record(id, format!("import {src} -> {}", opts.dest))
    }

    fn export(&self, id: &RuntimeId, src: &str, opts: &TransferOpts) -> Result<(), ExecutorError> {
        opts.validate(src)?;
        self.record(id, format!("export {src} -> {}", opts.dest))
    }

    fn close(&self, id: &RuntimeId) -> Result<(), ExecutorError> {
        let mut state = self.lock();
        state
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ExecutorError::UnknownRuntime(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_records_operations_in_order() {
        let backend = MockBackend::new();
        let id = RuntimeId::new("rt-1");
        backend.open(&id, &RuntimeConfig::host()).unwrap();

        let mut events = Vec::new();
        let code = backend
            .exec(&id, &ExecOpts::new("make").arg("all"), &mut events)
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(events[1], ExecEvent::stdout("mock-exec: make all\n"));

        backend
            .import(&id, "src", &TransferOpts::new().with_dest("code/"))
            .unwrap();
        assert_eq!(
            backend.history(&id).unwrap(),
            vec!["exec make all", "import src -> code/"]
        );
    }

    #[test]
    fn mock_close_forgets_runtime() {
        let backend = MockBackend::new();
        let id = RuntimeId::new("rt-1");
        backend.open(&id, &RuntimeConfig::host()).unwrap();
        backend.close(&id).unwrap();
        assert!(backend.history(&id).is_none());
        assert!(matches!(
            backend.close(&id),
            Err(ExecutorError::UnknownRuntime(_))
        ));
    }
}
