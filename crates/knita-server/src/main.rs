use clap::Parser;
use knita_executor::{select_backend, ExecutorBackend};
use knita_schema::BuildId;
use knita_server::{ControlPlaneServer, ControlPlaneState};
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Exit code used when the build is interrupted with ctrl-c.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "knita",
    version,
    about = "Run a build command against a local Knita control plane"
)]
struct Cli {
    /// Address the control plane listens on.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: String,

    /// Directory runtimes import from and export to (defaults to the current directory).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Executor backend: host or mock.
    #[arg(long, default_value = "host")]
    backend: String,

    /// Build id to serve instead of a freshly generated one.
    #[arg(long)]
    build_id: Option<String>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Build command and its arguments. Without one, serve until interrupted.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn generate_build_id() -> BuildId {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seed = format!("{}:{nanos}", std::process::id());
    let hex = blake3::hash(seed.as_bytes()).to_hex();
    BuildId::new(format!("build-{}", &hex[..16]))
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let work_dir = match cli.work_dir.map_or_else(std::env::current_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            error!("cannot determine working directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let backend: Arc<dyn ExecutorBackend> = match select_backend(&cli.backend, &work_dir) {
        Ok(backend) => Arc::from(backend),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let build_id = cli.build_id.map_or_else(generate_build_id, BuildId::new);

    let state = Arc::new(ControlPlaneState::new(build_id.clone(), backend));
    let server = match ControlPlaneServer::bind(&cli.listen, Arc::clone(&state)) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let Some(addr) = server.local_addr() else {
        error!("control plane is not listening on an IP address");
        return ExitCode::FAILURE;
    };
    let shutdown = server.shutdown_handle();

    {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("interrupted, closing open runtimes");
            state.close_all();
            shutdown.shutdown();
            std::process::exit(EXIT_INTERRUPTED);
        }) {
            warn!("failed to install ctrl-c handler: {e}");
        }
    }

    info!("build {build_id}: control plane on {addr}, work dir {}", work_dir.display());

    let Some((program, args)) = cli.command.split_first() else {
        server.run();
        state.close_all();
        return ExitCode::SUCCESS;
    };

    let serve = std::thread::spawn(move || server.run());
    let status = Command::new(program)
        .args(args)
        .current_dir(&work_dir)
        .env("KNITA_BUILD_ID", build_id.as_str())
        .env("KNITA_SOCKET", addr.to_string())
        .status();

    let leaked = state.close_all();
    if leaked > 0 {
        warn!("build left {leaked} runtime(s) open; closed them");
    }
    shutdown.shutdown();
    let _ = serve.join();

    match status {
        Ok(status) => {
            let code = status.code().unwrap_or(1);
            info!("build command exited with {code}");
            exit_code(code)
        }
        Err(e) => {
            error!("failed to start build command '{program}': {e}");
            ExitCode::FAILURE
        }
    }
}
