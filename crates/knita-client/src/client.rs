use crate::control::ControlPlane;
use crate::http::HttpControlPlane;
use crate::runtime::Runtime;
use crate::scoped::ScopedRuntime;
use crate::{ClientConfig, Error};
use knita_protocol::{OpenOpts, OpenRequest};
use knita_schema::RuntimeConfig;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point for a build process: opens runtimes on one control plane.
///
/// All runtimes opened by a client share its control-plane connection.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    plane: Arc<dyn ControlPlane>,
}

impl Client {
    /// Client talking HTTP to `config.address`.
    pub fn new(config: ClientConfig) -> Self {
        let plane = Arc::new(HttpControlPlane::new(&config));
        Self { config, plane }
    }

    /// Client configured from `KNITA_BUILD_ID` and `KNITA_SOCKET`.
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    pub fn with_control_plane(config: ClientConfig, plane: Arc<dyn ControlPlane>) -> Self {
        Self { config, plane }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a runtime. The configuration is validated before anything is sent.
    pub fn open(&self, runtime: &RuntimeConfig) -> Result<Runtime, Error> {
        runtime.validate()?;
        let request = OpenRequest {
            build_id: self.config.build_id.to_string(),
            opts: OpenOpts::from(runtime),
        };
        debug!(
            "open {} runtime for build {}",
            runtime.backend.name(),
            self.config.build_id
        );
        let opened = self.plane.open(&request)?;
        info!(
            "opened runtime {} ({}) at {}",
            opened.runtime_id,
            runtime.display_name().unwrap_or(runtime.backend.name()),
            opened.work_directory
        );
        Ok(Runtime::new(opened, Arc::clone(&self.plane)))
    }

    /// Open a runtime that is closed when the returned guard is dropped.
    pub fn open_scoped(&self, runtime: &RuntimeConfig) -> Result<ScopedRuntime, Error> {
        self.open(runtime).map(ScopedRuntime::new)
    }

    /// Open a runtime, run `body` with it, and close it on every exit path,
    /// including a panic in `body`.
    ///
    /// An error from `body` takes precedence over a failed close, which is
    /// then only logged.
    pub fn with_runtime<T, F>(&self, runtime: &RuntimeConfig, body: F) -> Result<T, Error>
    where
        F: FnOnce(&Runtime) -> Result<T, Error>,
    {
        let rt = self.open_scoped(runtime)?;
        let result = body(&rt);
        let id = rt.id().clone();
        match (result, rt.close()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!("failed to close runtime {id}: {close_err}");
                Err(err)
            }
        }
    }
}
