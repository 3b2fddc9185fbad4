//! Client side of the Knita runtime control protocol.
//!
//! A build process uses [`Client`] to open ephemeral runtimes on a remote
//! control plane, run commands in them through [`Runtime::exec`], move files
//! with [`Runtime::import`] / [`Runtime::export`], and release them with
//! [`Runtime::close`]. The control plane itself is reached through the
//! [`ControlPlane`] trait; [`HttpControlPlane`] is the HTTP implementation and
//! [`mock::MockControlPlane`] a scripted one for tests.

pub mod client;
pub mod config;
pub mod control;
pub mod exec;
pub mod http;
pub mod mock;
pub mod runtime;
pub mod scoped;

pub use client::Client;
pub use config::{ClientConfig, ENV_BUILD_ID, ENV_SOCKET};
pub use control::{ControlPlane, EventStream};
pub use exec::{demux, ExecOutcome, ExecOutput, ExecSinks};
pub use http::HttpControlPlane;
pub use runtime::Runtime;
pub use scoped::ScopedRuntime;

pub use knita_protocol::ExecEvent;
pub use knita_schema::{
    Backend, ConfigError, DockerOpts, ExecOpts, PullStrategy, RegistryAuth, RuntimeConfig,
    SystemInfo, TransferOpts,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("runtime {runtime_id} is closed, cannot {operation}")]
    InvalidState {
        runtime_id: String,
        operation: &'static str,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("remote execution failed: {0}")]
    RemoteExecution(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("command exited with code {exit_code}")]
    ExecExit { exit_code: i32 },
    #[error("{operation} failed: {message}")]
    Transfer {
        operation: &'static str,
        message: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Exit code of a command that ran and exited non-zero.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExecExit { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Failure of the RPC itself, as opposed to the command it carried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach control plane at {address}: {message}")]
    Connection { address: String, message: String },
    #[error("control plane rejected {method} with HTTP {status}: {message}")]
    Rejected {
        method: &'static str,
        status: u16,
        message: String,
    },
    #[error("cannot encode {method} request: {message}")]
    Encode {
        method: &'static str,
        message: String,
    },
    #[error("undecodable {method} response: {message}")]
    Decode {
        method: &'static str,
        message: String,
    },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
