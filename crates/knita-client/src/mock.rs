//! Scripted in-memory control plane for tests.

use crate::control::{ControlPlane, EventStream};
use crate::TransportError;
use knita_protocol::{
    CloseRequest, ExecEvent, ExecRequest, Method, OpenOpts, OpenRequest, OpenResponse,
    ProtocolError, TransferRequest,
};
use knita_schema::{ExecOpts, SystemInfo};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One call received by the mock, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open { build_id: String, opts: OpenOpts },
    Exec { runtime_id: String, opts: ExecOpts },
    Import(TransferRequest),
    Export(TransferRequest),
    Close { runtime_id: String },
}

impl MockCall {
    pub fn method(&self) -> Method {
        match self {
            Self::Open { .. } => Method::Open,
            Self::Exec { .. } => Method::Exec,
            Self::Import(_) => Method::Import,
            Self::Export(_) => Method::Export,
            Self::Close { .. } => Method::Close,
        }
    }
}

/// One step of a scripted exec response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Event(ExecEvent),
    /// The stream breaks with an I/O error.
    Abort(String),
    /// A line that fails to decode.
    Garbage(String),
}

impl From<ExecEvent> for ScriptStep {
    fn from(event: ExecEvent) -> Self {
        Self::Event(event)
    }
}

#[derive(Debug, Clone)]
enum Failure {
    Rejected { status: u16, message: String },
    Connection(String),
}

#[derive(Default)]
struct Inner {
    calls: Vec<MockCall>,
    scripts: VecDeque<Vec<ScriptStep>>,
    failures: HashMap<Method, Failure>,
}

/// In-memory [`ControlPlane`].
///
/// Execs replay queued scripts in order; with no script queued a command
/// starts and exits 0. Failures can be injected per method.
#[derive(Default)]
pub struct MockControlPlane {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    exec_delay: Mutex<Option<Duration>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the response to the next Exec.
    pub fn script_exec<S: Into<ScriptStep>>(&self, steps: impl IntoIterator<Item = S>) {
        self.lock()
            .scripts
            .push_back(steps.into_iter().map(Into::into).collect());
    }

    /// Reject every call of `method` with an HTTP status.
    pub fn reject(&self, method: Method, status: u16, message: &str) {
        self.lock().failures.insert(
            method,
            Failure::Rejected {
                status,
                message: message.to_owned(),
            },
        );
    }

    /// Fail every call of `method` as if the control plane were unreachable.
    pub fn disconnect(&self, method: Method, message: &str) {
        self.lock()
            .failures
            .insert(method, Failure::Connection(message.to_owned()));
    }

    /// Make each Exec call block for `delay` before its stream is returned.
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.calls().iter().filter(|c| c.method() == method).count()
    }

    /// Highest number of exec streams that were alive at the same time.
    pub fn max_concurrent_execs(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: MockCall) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let method = call.method();
        inner.calls.push(call);
        match inner.failures.get(&method) {
            None => Ok(()),
            Some(Failure::Rejected { status, message }) => Err(TransportError::Rejected {
                method: method.name(),
                status: *status,
                message: message.clone(),
            }),
            Some(Failure::Connection(message)) => Err(TransportError::Connection {
                address: "mock".to_owned(),
                message: message.clone(),
            }),
        }
    }
}

impl ControlPlane for MockControlPlane {
    fn open(&self, request: &OpenRequest) -> Result<OpenResponse, TransportError> {
        self.record(MockCall::Open {
            build_id: request.build_id.clone(),
            opts: request.opts.clone(),
        })?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OpenResponse {
            runtime_id: format!("mock-rt-{n}"),
            work_directory: format!("/mock/work/{n}"),
            system_info: SystemInfo {
                os: "linux".to_owned(),
                arch: "amd64".to_owned(),
                total_cpu_cores: 2,
                total_memory: 4 << 30,
            },
        })
    }

    fn exec(&self, request: &ExecRequest) -> Result<EventStream, TransportError> {
        self.record(MockCall::Exec {
            runtime_id: request.runtime_id.clone(),
            opts: request.opts.clone(),
        })?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.exec_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let steps = self.lock().scripts.pop_front().unwrap_or_else(|| {
            vec![
                ScriptStep::Event(ExecEvent::Start),
                ScriptStep::Event(ExecEvent::exited(0)),
            ]
        });
        Ok(Box::new(ScriptedStream {
            steps: steps.into_iter(),
            in_flight: Arc::clone(&self.in_flight),
        }))
    }

    fn import(&self, request: &TransferRequest) -> Result<(), TransportError> {
        self.record(MockCall::Import(request.clone()))
    }

    fn export(&self, request: &TransferRequest) -> Result<(), TransportError> {
        self.record(MockCall::Export(request.clone()))
    }

    fn close(&self, request: &CloseRequest) -> Result<(), TransportError> {
        self.record(MockCall::Close {
            runtime_id: request.runtime_id.clone(),
        })
    }
}

struct ScriptedStream {
    steps: std::vec::IntoIter<ScriptStep>,
    in_flight: Arc<AtomicUsize>,
}

impl Iterator for ScriptedStream {
    type Item = Result<ExecEvent, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(match self.steps.next()? {
            ScriptStep::Event(event) => Ok(event),
            ScriptStep::Abort(msg) => Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                msg,
            ))),
            ScriptStep::Garbage(line) => Err(ProtocolError::Malformed(line)),
        })
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
