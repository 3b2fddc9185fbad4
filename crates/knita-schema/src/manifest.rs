use crate::config::{
    Backend, ConfigError, DockerOpts, PullStrategy, RegistryAuth, RuntimeConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Loosely-typed runtime description, as written in a `knita.toml` file or
/// assembled from dynamic input. Turned into a [`RuntimeConfig`] by
/// [`RuntimeManifest::validate`].
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeManifest {
    pub backend: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub docker: Option<DockerSection>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DockerSection {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub pull_strategy: Option<String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuthSection>,
    #[serde(default)]
    pub aws_ecr_auth: Option<AwsEcrAuthSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BasicAuthSection {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AwsEcrAuthSection {
    pub region: String,
    pub access_key_id: String,
    pub secret_key: String,
}

impl RuntimeManifest {
    pub fn validate(&self) -> Result<RuntimeConfig, ConfigError> {
        let backend = match self.backend.as_str() {
            "host" => {
                if self.docker.is_some() {
                    return Err(ConfigError::DockerOptionOnHost("docker"));
                }
                Backend::Host
            }
            "docker" => {
                let section = self.docker.as_ref().ok_or(ConfigError::EmptyImage)?;
                Backend::Docker(section.validate()?)
            }
            other => return Err(ConfigError::UnknownBackend(other.to_owned())),
        };

        let config = RuntimeConfig {
            backend,
            tags: self.tags.clone(),
            labels: self.labels.iter().cloned().collect::<BTreeSet<_>>(),
        };
        config.validate()?;
        Ok(config)
    }
}

impl DockerSection {
    fn validate(&self) -> Result<DockerOpts, ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::EmptyImage);
        }
        let registry_auth = match (&self.basic_auth, &self.aws_ecr_auth) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingAuth),
            (Some(basic), None) => Some(RegistryAuth::Basic {
                username: basic.username.clone(),
                password: basic.password.clone(),
            }),
            (None, Some(ecr)) => Some(RegistryAuth::AwsEcr {
                region: ecr.region.clone(),
                access_key_id: ecr.access_key_id.clone(),
                secret_key: ecr.secret_key.clone(),
            }),
            (None, None) => None,
        };
        let pull_strategy = self
            .pull_strategy
            .as_deref()
            .map(str::parse::<PullStrategy>)
            .transpose()?;

        let mut opts = DockerOpts::new(self.image.clone());
        opts.pull_strategy = pull_strategy;
        opts.registry_auth = registry_auth;
        Ok(opts)
    }
}

pub fn parse_runtime_str(input: &str) -> Result<RuntimeManifest, ConfigError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_runtime_file(path: impl AsRef<Path>) -> Result<RuntimeManifest, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_runtime_str(&content)
}
