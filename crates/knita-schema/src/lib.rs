//! Runtime configuration model and request options for Knita.
//!
//! This crate defines the data layer shared by the client, the control plane and
//! the executor: the variant-typed runtime configuration (`RuntimeConfig`, with its
//! Host and Docker backends and registry auth schemes), the loosely-typed TOML
//! form it is validated from (`RuntimeManifest`), command options (`ExecOpts`),
//! file transfer options (`TransferOpts`), the executor's `SystemInfo` snapshot,
//! and identifier newtypes.

pub mod config;
pub mod exec;
pub mod manifest;
pub mod sysinfo;
pub mod transfer;
pub mod types;

pub use config::{Backend, ConfigError, DockerOpts, PullStrategy, RegistryAuth, RuntimeConfig};
pub use exec::ExecOpts;
pub use manifest::{
    parse_runtime_file, parse_runtime_str, AwsEcrAuthSection, BasicAuthSection, DockerSection,
    RuntimeManifest,
};
pub use sysinfo::SystemInfo;
pub use transfer::{validate_relative_path, TransferOpts};
pub use types::{BuildId, RuntimeId};

/// Tag key that tooling displays as the human-readable name of a runtime or command.
pub const NAME_TAG: &str = "name";
