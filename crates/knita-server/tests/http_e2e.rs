//! End-to-end tests: the real HTTP client against a real control plane
//! driving the host executor.

#![cfg(unix)]

use knita_client::{
    Client, ClientConfig, DockerOpts, Error, ExecOpts, ExecSinks, RuntimeConfig, TransferOpts,
};
use knita_executor::{HostBackend, MockBackend};
use knita_protocol::{Method, PROTOCOL_HEADER};
use knita_server::TestServer;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BUILD_ID: &str = "build-e2e";

struct Harness {
    server: TestServer,
    local: TempDir,
    _scratch: TempDir,
}

impl Harness {
    fn client(&self) -> Client {
        Client::new(ClientConfig::new(BUILD_ID, &self.server.url))
    }
}

fn start_server() -> Harness {
    let local = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let backend = HostBackend::new(local.path()).with_scratch_root(scratch.path());
    let server = TestServer::start(BUILD_ID, Arc::new(backend));
    Harness {
        server,
        local,
        _scratch: scratch,
    }
}

fn sh(script: &str) -> ExecOpts {
    ExecOpts::new("sh").arg("-c").arg(script)
}

fn raw_post(url: &str, body: &str, version: Option<&str>) -> (u16, String) {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .build()
        .into();
    let mut request = agent.post(url);
    if let Some(version) = version {
        request = request.header(PROTOCOL_HEADER, version);
    }
    let mut resp = request.send(body).unwrap();
    let status = resp.status().as_u16();
    let text = resp.body_mut().read_to_string().unwrap_or_default();
    (status, text)
}

#[test]
fn open_reports_work_directory_and_system_info() {
    let h = start_server();
    let runtime = h.client().open(&RuntimeConfig::host()).unwrap();

    assert!(runtime.id().starts_with("rt-"));
    assert!(std::path::Path::new(runtime.work_directory()).is_dir());
    assert!(runtime.system_info().total_cpu_cores >= 1);
    assert_eq!(h.server.state.open_runtimes().len(), 1);

    runtime.close().unwrap();
    assert!(h.server.state.open_runtimes().is_empty());
}

#[test]
fn exec_streams_output_and_reports_nonzero_exit() {
    let h = start_server();
    let runtime = h.client().open(&RuntimeConfig::host()).unwrap();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let err = runtime
        .exec(
            &sh("printf a; printf b >&2; printf c; exit 3"),
            ExecSinks::new(&mut stdout, &mut stderr),
        )
        .unwrap_err();

    assert!(matches!(err, Error::ExecExit { exit_code: 3 }));
    assert_eq!(stdout, b"ac");
    assert_eq!(stderr, b"b");
    runtime.close().unwrap();
}

/// Sink that remembers when its first byte arrived.
#[derive(Default)]
struct FirstByteClock {
    first: Option<Instant>,
    data: Vec<u8>,
}

impl Write for FirstByteClock {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !buf.is_empty() && self.first.is_none() {
            self.first = Some(Instant::now());
        }
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn exec_output_arrives_before_the_command_exits() {
    let h = start_server();
    let runtime = h.client().open(&RuntimeConfig::host()).unwrap();

    let mut stdout = FirstByteClock::default();
    let mut stderr = Vec::new();
    let started = Instant::now();
    runtime
        .exec(
            &sh("echo hi; sleep 2; echo done"),
            ExecSinks::new(&mut stdout, &mut stderr),
        )
        .unwrap();
    let total = started.elapsed();

    let first = stdout.first.unwrap().duration_since(started);
    assert!(total >= Duration::from_secs(2), "exec returned after {total:?}");
    assert!(
        first < Duration::from_millis(1500),
        "first output after {first:?}, command took {total:?}"
    );
    assert_eq!(stdout.data, b"hi\ndone\n");
    runtime.close().unwrap();
}

#[test]
fn exec_output_returns_exit_code_as_data() {
    let h = start_server();
    let runtime = h.client().open(&RuntimeConfig::host()).unwrap();

    let ok = runtime
        .exec_output(&sh("echo \"$GREETING\"").env("GREETING", "hello"))
        .unwrap();
    assert!(ok.success());
    assert_eq!(ok.stdout_lossy(), "hello\n");

    let failed = runtime.exec_output(&sh("exit 7")).unwrap();
    assert_eq!(failed.exit_code, 7);
    runtime.close().unwrap();
}

#[test]
fn spawn_failure_is_remote_execution_error() {
    let h = start_server();
    let runtime = h.client().open(&RuntimeConfig::host()).unwrap();

    let err = runtime
        .exec(
            &ExecOpts::new("definitely-not-a-real-command-knita"),
            ExecSinks::discard(),
        )
        .unwrap_err();
    match err {
        Error::RemoteExecution(message) => {
            assert!(message.contains("definitely-not-a-real-command-knita"));
        }
        other => panic!("unexpected {other:?}"),
    }
    runtime.close().unwrap();
}

#[test]
fn import_exec_export_roundtrip() {
    let h = start_server();
    fs::create_dir_all(h.local.path().join("src")).unwrap();
    fs::write(h.local.path().join("src/input.txt"), "knita").unwrap();
    fs::write(h.local.path().join("src/skip.log"), "noise").unwrap();

    let runtime = h.client().open(&RuntimeConfig::host()).unwrap();
    runtime
        .import(
            "src",
            &TransferOpts::new()
                .with_dest("code/")
                .with_excludes(["**/*.log"]),
        )
        .unwrap();

    let listing = runtime.exec_output(&sh("ls code/src")).unwrap();
    assert_eq!(listing.stdout_lossy(), "input.txt\n");

    runtime
        .exec(
            &sh("mkdir -p out && tr a-z A-Z < code/src/input.txt > out/result.txt"),
            ExecSinks::discard(),
        )
        .unwrap();
    runtime
        .export("out/result.txt", &TransferOpts::new().with_dest("artifacts/"))
        .unwrap();

    assert_eq!(
        fs::read_to_string(h.local.path().join("artifacts/result.txt")).unwrap(),
        "KNITA"
    );
    runtime.close().unwrap();
}

#[test]
fn export_of_missing_path_is_transfer_error() {
    let h = start_server();
    let runtime = h.client().open(&RuntimeConfig::host()).unwrap();
    let err = runtime
        .export("nothing-here", &TransferOpts::new())
        .unwrap_err();
    assert!(matches!(err, Error::Transfer { operation: "export", .. }));
    runtime.close().unwrap();
}

#[test]
fn docker_runtime_is_rejected_by_host_executor() {
    let h = start_server();
    let err = h
        .client()
        .open(&RuntimeConfig::docker(DockerOpts::new("alpine:3.20")))
        .unwrap_err();
    match err {
        Error::Transport(e) => assert_eq!(e.status(), Some(500)),
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.server.state.open_runtimes().is_empty());
}

#[test]
fn foreign_build_id_is_forbidden() {
    let h = start_server();
    let client = Client::new(ClientConfig::new("some-other-build", &h.server.url));
    match client.open(&RuntimeConfig::host()).unwrap_err() {
        Error::Transport(e) => assert_eq!(e.status(), Some(403)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn missing_or_wrong_protocol_version_is_rejected() {
    let h = start_server();
    let url = format!("{}{}", h.server.url, Method::Close.path());
    let body = r#"{"runtime_id":"rt-x"}"#;

    let (status, text) = raw_post(&url, body, None);
    assert_eq!(status, 400);
    assert!(text.contains(PROTOCOL_HEADER));

    let (status, _) = raw_post(&url, body, Some("2"));
    assert_eq!(status, 400);

    let (status, _) = raw_post(&url, body, Some("1"));
    assert_eq!(status, 404);
}

#[test]
fn malformed_body_and_unknown_endpoint() {
    let h = start_server();
    let (status, text) = raw_post(
        &format!("{}{}", h.server.url, Method::Open.path()),
        "{not json",
        Some("1"),
    );
    assert_eq!(status, 400);
    assert!(text.contains("invalid open request"));

    let (status, _) = raw_post(&format!("{}/v1/restart", h.server.url), "{}", Some("1"));
    assert_eq!(status, 404);
}

#[test]
fn closed_handle_makes_no_further_calls() {
    let h = start_server();
    let runtime = h.client().open(&RuntimeConfig::host()).unwrap();
    runtime.close().unwrap();

    assert!(matches!(
        runtime.exec(&sh("true"), ExecSinks::discard()),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(runtime.close(), Err(Error::InvalidState { .. })));
}

#[test]
fn with_runtime_closes_on_body_error() {
    let h = start_server();
    let err = h
        .client()
        .with_runtime(&RuntimeConfig::host(), |rt| {
            rt.exec(&sh("exit 4"), ExecSinks::discard())
        })
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(4));
    assert!(h.server.state.open_runtimes().is_empty());
}

#[test]
fn close_all_reaps_leaked_runtimes() {
    let h = start_server();
    let client = h.client();
    let a = client.open(&RuntimeConfig::host()).unwrap();
    let b = client.open(&RuntimeConfig::host()).unwrap();
    let work_a = a.work_directory().to_owned();

    assert_eq!(h.server.state.close_all(), 2);
    assert!(!std::path::Path::new(&work_a).exists());

    match b.exec(&sh("true"), ExecSinks::discard()).unwrap_err() {
        Error::Transport(e) => assert_eq!(e.status(), Some(404)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn runtimes_run_independently() {
    let h = start_server();
    let client = h.client();
    let slow = client.open(&RuntimeConfig::host()).unwrap();
    let fast = client.open(&RuntimeConfig::host()).unwrap();

    std::thread::scope(|s| {
        let waiter = s.spawn(|| slow.exec_output(&sh("sleep 1; echo slow")).unwrap());
        let quick = fast.exec_output(&sh("echo fast")).unwrap();
        assert_eq!(quick.stdout_lossy(), "fast\n");
        assert_eq!(waiter.join().unwrap().stdout_lossy(), "slow\n");
    });

    slow.close().unwrap();
    fast.close().unwrap();
}

#[test]
fn mock_backend_echoes_commands() {
    let server = TestServer::start(BUILD_ID, Arc::new(MockBackend::new()));
    let client = Client::new(ClientConfig::new(BUILD_ID, &server.url));
    let runtime = client.open(&RuntimeConfig::host()).unwrap();
    let out = runtime
        .exec_output(&ExecOpts::new("make").arg("test"))
        .unwrap();
    assert_eq!(out.stdout_lossy(), "mock-exec: make test\n");
    runtime.close().unwrap();
}
