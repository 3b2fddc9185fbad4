use knita_schema::{BuildId, ConfigError};

/// Environment variable carrying the build id issued by the control plane.
pub const ENV_BUILD_ID: &str = "KNITA_BUILD_ID";
/// Environment variable carrying the control-plane address.
pub const ENV_SOCKET: &str = "KNITA_SOCKET";

/// How a build process reaches its control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub build_id: BuildId,
    /// `host:port` or `http://host:port`.
    pub address: String,
}

impl ClientConfig {
    pub fn new(build_id: &str, address: &str) -> Self {
        Self {
            build_id: BuildId::new(build_id),
            address: address.trim_end_matches('/').to_owned(),
        }
    }

    /// Read `KNITA_BUILD_ID` and `KNITA_SOCKET` from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let build_id = required(&lookup, ENV_BUILD_ID)?;
        let address = required(&lookup, ENV_SOCKET)?;
        Ok(Self::new(&build_id, &address))
    }

    /// Base URL for HTTP requests, adding the `http://` scheme if absent.
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.clone()
        } else {
            format!("http://{}", self.address)
        }
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_owned()),
        _ => Err(ConfigError::MissingSetting(key)),
    }
}
