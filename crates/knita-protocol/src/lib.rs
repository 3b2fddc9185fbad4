//! Wire format of the Knita control-plane protocol.
//!
//! The control plane exposes five calls over HTTP/1.1 with JSON bodies:
//! - `POST /v1/open`:   [`OpenRequest`] → [`OpenResponse`]
//! - `POST /v1/exec`:   [`ExecRequest`] → newline-delimited [`ExecEvent`] stream
//! - `POST /v1/import`: [`TransferRequest`] → [`Empty`]
//! - `POST /v1/export`: [`TransferRequest`] → [`Empty`]
//! - `POST /v1/close`:  [`CloseRequest`] → [`Empty`]
//!
//! Failures are reported with a non-2xx status and an [`ErrorBody`].

mod b64;
pub mod event;
pub mod wire;

pub use event::{decode_event, encode_event, EventReader, ExecEvent};
pub use wire::{
    CloseRequest, DockerAuth, Empty, ErrorBody, ExecRequest, OpenOpts, OpenRequest, OpenResponse,
    TransferRequest, WireBackend,
};

use thiserror::Error;

/// Protocol version sent as `X-Knita-Protocol` header on all requests.
/// Servers reject clients with a missing or different version.
pub const PROTOCOL_VERSION: u32 = 1;

pub const PROTOCOL_HEADER: &str = "X-Knita-Protocol";

/// Content type of the exec event stream.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// The calls of the control-plane surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Open,
    Exec,
    Import,
    Export,
    Close,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Open,
        Method::Exec,
        Method::Import,
        Method::Export,
        Method::Close,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Exec => "exec",
            Self::Import => "import",
            Self::Export => "export",
            Self::Close => "close",
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Self::Open => "/v1/open",
            Self::Exec => "/v1/exec",
            Self::Import => "/v1/import",
            Self::Export => "/v1/export",
            Self::Close => "/v1/close",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        Self::ALL.into_iter().find(|m| m.path() == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_paths_roundtrip() {
        for method in Method::ALL {
            assert_eq!(Method::from_path(method.path()), Some(method));
        }
        assert_eq!(Method::from_path("/v1/exec?trace=1"), Some(Method::Exec));
        assert_eq!(Method::from_path("/v2/exec"), None);
        assert_eq!(Method::from_path("/"), None);
    }

    #[test]
    fn protocol_version_constant_is_1() {
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
