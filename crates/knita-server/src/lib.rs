//! Reference control plane for the Knita runtime protocol v1.
//!
//! Serves the five RPCs documented in `knita-protocol` over HTTP and drives
//! an [`ExecutorBackend`] for every runtime a build opens. Each request is
//! handled on its own thread so a long exec stream never blocks calls on
//! other runtimes.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

pub mod registry;

pub use registry::{ControlPlaneState, RuntimeRecord};

use knita_executor::{ExecEvent, ExecutorBackend, ExecutorError};
use knita_protocol::{
    encode_event, Empty, ErrorBody, Method, NDJSON_CONTENT_TYPE, PROTOCOL_HEADER,
    PROTOCOL_VERSION,
};
use knita_schema::BuildId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use thiserror::Error;
use tiny_http::{Header, Response, Server, StatusCode};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind control plane on {addr}: {message}")]
    Bind { addr: String, message: String },
}

/// A failed call, as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        let status = match e {
            ExecutorError::UnknownRuntime(_) => 404,
            ExecutorError::Config(_) => 400,
            _ => 500,
        };
        Self::new(status, e.to_string())
    }
}

/// Write an exec response straight onto the connection: the status line and
/// headers, then one chunk per event, flushing after each so output reaches
/// the client while the command is still running.
///
/// Ends with the terminating chunk once `events` is exhausted.
pub fn write_event_stream<W, I>(w: &mut W, events: I) -> io::Result<()>
where
    W: Write + ?Sized,
    I: IntoIterator<Item = ExecEvent>,
{
    write!(
        w,
        "HTTP/1.1 200 OK\r\nContent-Type: {NDJSON_CONTENT_TYPE}\r\n\
         Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
    )?;
    w.flush()?;
    for event in events {
        let line = encode_event(&event);
        write!(w, "{:X}\r\n", line.len())?;
        w.write_all(&line)?;
        w.write_all(b"\r\n")?;
        w.flush()?;
    }
    w.write_all(b"0\r\n\r\n")?;
    w.flush()
}

fn json_header() -> Header {
    Header::from_bytes("Content-Type", "application/json").expect("valid header")
}

fn respond_err(req: tiny_http::Request, err: &ApiError) {
    debug!("{} {}: {}", err.status, req.url(), err.message);
    let body = serde_json::to_vec(&ErrorBody::new(err.message.as_str())).unwrap_or_default();
    let _ = req.respond(
        Response::from_data(body)
            .with_status_code(StatusCode(err.status))
            .with_header(json_header()),
    );
}

fn respond_json(req: tiny_http::Request, value: &impl Serialize) {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let _ = req.respond(Response::from_data(body).with_header(json_header()));
        }
        Err(e) => {
            error!("cannot encode response: {e}");
            respond_err(req, &ApiError::new(500, format!("cannot encode response: {e}")));
        }
    }
}

fn respond_unary<T: Serialize>(req: tiny_http::Request, result: Result<T, ApiError>) {
    match result {
        Ok(value) => respond_json(req, &value),
        Err(e) => respond_err(req, &e),
    }
}

fn respond_events(req: tiny_http::Request, rx: mpsc::Receiver<ExecEvent>) {
    // tiny_http's own chunked encoder buffers several KiB before sending.
    let mut writer = req.into_writer();
    if let Err(e) = write_event_stream(&mut *writer, rx) {
        debug!("exec stream aborted by client: {e}");
    }
}

fn read_body(req: &mut tiny_http::Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    if req.as_reader().read_to_end(&mut body).is_ok() {
        Some(body)
    } else {
        None
    }
}

fn decode<T: DeserializeOwned>(method: Method, body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("invalid {} request: {e}", method.name())))
}

fn check_protocol(req: &tiny_http::Request) -> Result<(), ApiError> {
    let value = req
        .headers()
        .iter()
        .find(|h| h.field.equiv(PROTOCOL_HEADER))
        .map(|h| h.value.as_str().trim().to_owned())
        .ok_or_else(|| ApiError::bad_request(format!("missing {PROTOCOL_HEADER} header")))?;
    match value.parse::<u32>() {
        Ok(PROTOCOL_VERSION) => Ok(()),
        _ => Err(ApiError::bad_request(format!(
            "unsupported protocol version '{value}', expected {PROTOCOL_VERSION}"
        ))),
    }
}

/// Handle a single HTTP request, dispatching to the matching RPC.
pub fn handle_request(state: &ControlPlaneState, mut req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let Some(call) = Method::from_path(&url) else {
        respond_err(req, &ApiError::not_found(format!("no such endpoint: {url}")));
        return;
    };
    if method != tiny_http::Method::Post {
        respond_err(req, &ApiError::new(405, "method not allowed"));
        return;
    }
    if let Err(e) = check_protocol(&req) {
        respond_err(req, &e);
        return;
    }
    let Some(body) = read_body(&mut req) else {
        respond_err(req, &ApiError::bad_request("read error"));
        return;
    };

    match call {
        Method::Open => respond_unary(req, decode(call, &body).and_then(|r| state.open(&r))),
        Method::Exec => match decode(call, &body).and_then(|r| state.start_exec(r)) {
            Ok(rx) => respond_events(req, rx),
            Err(e) => respond_err(req, &e),
        },
        Method::Import => respond_unary(
            req,
            decode(call, &body)
                .and_then(|r| state.import(&r))
                .map(|()| Empty {}),
        ),
        Method::Export => respond_unary(
            req,
            decode(call, &body)
                .and_then(|r| state.export(&r))
                .map(|()| Empty {}),
        ),
        Method::Close => respond_unary(
            req,
            decode(call, &body)
                .and_then(|r| state.close(&r))
                .map(|()| Empty {}),
        ),
    }
}

/// Stops a running [`ControlPlaneServer`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Server>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.unblock();
    }
}

pub struct ControlPlaneServer {
    server: Arc<Server>,
    state: Arc<ControlPlaneState>,
}

impl ControlPlaneServer {
    pub fn bind(addr: &str, state: Arc<ControlPlaneState>) -> Result<Self, ServerError> {
        let server = Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            message: e.to_string(),
        })?;
        Ok(Self {
            server: Arc::new(server),
            state,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    pub fn state(&self) -> &Arc<ControlPlaneState> {
        &self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.server))
    }

    /// Serve until shut down, one thread per request.
    pub fn run(&self) {
        info!(
            "control plane for build {} serving on {:?} with {} backend",
            self.state.build_id(),
            self.local_addr(),
            self.state.backend_name()
        );
        for request in self.server.incoming_requests() {
            let state = Arc::clone(&self.state);
            std::thread::spawn(move || handle_request(&state, request));
        }
        info!("control plane stopped");
    }
}

/// A test helper that starts a control plane on a random port in a background thread.
///
/// Drop the `TestServer` to stop accepting requests (via `Server::unblock`).
/// Runtimes still open stay registered until [`ControlPlaneState::close_all`].
pub struct TestServer {
    pub url: String,
    pub addr: SocketAddr,
    pub state: Arc<ControlPlaneState>,
    shutdown: ShutdownHandle,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server for `build_id` over `backend`.
    /// Binds to `127.0.0.1:0` (random port).
    pub fn start(build_id: &str, backend: Arc<dyn ExecutorBackend>) -> Self {
        let state = Arc::new(ControlPlaneState::new(BuildId::new(build_id), backend));
        let server = ControlPlaneServer::bind("127.0.0.1:0", Arc::clone(&state))
            .expect("failed to bind test HTTP server");
        let addr = server.local_addr().expect("not an IP addr");
        let url = format!("http://{addr}");
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || server.run());

        Self {
            url,
            addr,
            state,
            shutdown,
            _handle: handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knita_protocol::EventReader;
    use knita_schema::ConfigError;

    /// Writer that records the buffered bytes at every flush.
    #[derive(Default)]
    struct FlushLog {
        buf: Vec<u8>,
        flushed: Vec<usize>,
    }

    impl Write for FlushLog {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.buf.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushed.push(self.buf.len());
            Ok(())
        }
    }

    fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
        let text = String::from_utf8_lossy(raw);
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        (head.to_owned(), body.as_bytes().to_vec())
    }

    /// Undo chunked transfer coding, checking the terminating chunk is present.
    fn dechunk(mut body: &[u8]) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        loop {
            let crlf = body.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = std::str::from_utf8(&body[..crlf]).unwrap();
            let len = usize::from_str_radix(size, 16).unwrap();
            body = &body[crlf + 2..];
            if len == 0 {
                assert_eq!(body, b"\r\n");
                return chunks;
            }
            chunks.push(body[..len].to_vec());
            assert_eq!(&body[len..len + 2], b"\r\n");
            body = &body[len + 2..];
        }
    }

    #[test]
    fn event_stream_is_one_chunk_per_event_in_order() {
        let (tx, rx) = mpsc::channel();
        tx.send(ExecEvent::Start).unwrap();
        tx.send(ExecEvent::stdout("a")).unwrap();
        tx.send(ExecEvent::stderr("b")).unwrap();
        tx.send(ExecEvent::exited(2)).unwrap();
        drop(tx);

        let mut out = Vec::new();
        write_event_stream(&mut out, rx).unwrap();
        let (head, body) = split_response(&out);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains(&format!("Content-Type: {NDJSON_CONTENT_TYPE}")));
        assert!(head.contains("Transfer-Encoding: chunked"));

        let chunks = dechunk(&body);
        let events: Vec<_> = chunks
            .iter()
            .flat_map(|c| EventReader::new(c.as_slice()))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(
            events,
            vec![
                ExecEvent::Start,
                ExecEvent::stdout("a"),
                ExecEvent::stderr("b"),
                ExecEvent::exited(2),
            ]
        );
    }

    #[test]
    fn every_event_is_flushed_before_the_next_is_received() {
        let (tx, rx) = mpsc::channel();
        let mut log = FlushLog::default();
        let producer = std::thread::spawn(move || {
            tx.send(ExecEvent::Start).unwrap();
            tx.send(ExecEvent::stdout("hi\n")).unwrap();
            tx.send(ExecEvent::exited(0)).unwrap();
        });
        write_event_stream(&mut log, rx).unwrap();
        producer.join().unwrap();

        // Headers, three events, terminator.
        assert_eq!(log.flushed.len(), 5);
        assert_eq!(*log.flushed.last().unwrap(), log.buf.len());
        let (head, _) = split_response(&log.buf);
        let head_len = head.len() + 4;
        let first_chunk = encode_event(&ExecEvent::Start);
        let size_line = format!("{:X}\r\n", first_chunk.len());
        let expected = head_len + size_line.len() + first_chunk.len() + 2;
        assert_eq!(log.flushed[0], head_len);
        assert_eq!(log.flushed[1], expected);
    }

    #[test]
    fn empty_stream_still_terminates() {
        let (tx, rx) = mpsc::channel::<ExecEvent>();
        drop(tx);
        let mut out = Vec::new();
        write_event_stream(&mut out, rx).unwrap();
        let (_, body) = split_response(&out);
        assert_eq!(body, b"0\r\n\r\n");
    }

    #[test]
    fn executor_errors_map_to_statuses() {
        assert_eq!(
            ApiError::from(ExecutorError::UnknownRuntime("rt-x".into())).status,
            404
        );
        assert_eq!(
            ApiError::from(ExecutorError::Config(ConfigError::EmptyCommand)).status,
            400
        );
        assert_eq!(
            ApiError::from(ExecutorError::BackendUnavailable("docker".into())).status,
            500
        );
    }

    #[test]
    fn bind_failure_is_reported() {
        let err = ControlPlaneServer::bind(
            "not-an-address",
            Arc::new(ControlPlaneState::new(
                BuildId::new("b"),
                Arc::new(knita_executor::MockBackend::new()),
            )),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("not-an-address"));
    }
}
