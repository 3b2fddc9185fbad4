use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read runtime file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse runtime file: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unknown runtime backend: '{0}', expected 'host' or 'docker'")]
    UnknownBackend(String),
    #[error("docker backend requires a non-empty image")]
    EmptyImage,
    #[error("at most one docker registry auth may be set, got both basic and AWS ECR auth")]
    ConflictingAuth,
    #[error("unknown docker pull strategy: '{0}', expected 'always', 'never' or 'if-not-present'")]
    UnknownPullStrategy(String),
    #[error("'{0}' is only valid for the docker backend")]
    DockerOptionOnHost(&'static str),
    #[error("exec command name must not be empty")]
    EmptyCommand,
    #[error("invalid environment entry '{0}', expected 'KEY=value'")]
    InvalidEnv(String),
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),
}

/// When the executor should pull the container image before starting a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullStrategy {
    /// Always pull prior to starting the runtime.
    Always,
    /// Never pull; images are provisioned on executors out of band.
    Never,
    /// Pull only when no matching image exists on the executor.
    #[serde(alias = "not-exists")]
    IfNotPresent,
}

impl PullStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::IfNotPresent => "if-not-present",
        }
    }
}

impl fmt::Display for PullStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PullStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "if-not-present" | "not-exists" => Ok(Self::IfNotPresent),
            other => Err(ConfigError::UnknownPullStrategy(other.to_owned())),
        }
    }
}

/// Credentials used to pull from a private container registry.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    Basic {
        username: String,
        password: String,
    },
    AwsEcr {
        region: String,
        access_key_id: String,
        secret_key: String,
    },
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::AwsEcr {
                region,
                access_key_id,
                ..
            } => f
                .debug_struct("AwsEcr")
                .field("region", region)
                .field("access_key_id", access_key_id)
                .field("secret_key", &"<redacted>")
                .finish(),
        }
    }
}

/// Options of the containerized backend.
///
/// Built with [`DockerOpts::new`]; applying a second registry auth scheme is
/// remembered and rejected by [`RuntimeConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerOpts {
    pub image: String,
    pub pull_strategy: Option<PullStrategy>,
    pub registry_auth: Option<RegistryAuth>,
    conflicting_auth: bool,
}

impl DockerOpts {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            pull_strategy: None,
            registry_auth: None,
            conflicting_auth: false,
        }
    }

    #[must_use]
    pub fn with_pull_strategy(mut self, strategy: PullStrategy) -> Self {
        self.pull_strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_basic_auth(self, username: &str, password: &str) -> Self {
        self.with_auth(RegistryAuth::Basic {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }

    #[must_use]
    pub fn with_aws_ecr_auth(self, region: &str, access_key_id: &str, secret_key: &str) -> Self {
        self.with_auth(RegistryAuth::AwsEcr {
            region: region.to_owned(),
            access_key_id: access_key_id.to_owned(),
            secret_key: secret_key.to_owned(),
        })
    }

    /// Setting the same scheme again replaces the credentials; a different
    /// scheme is a conflict reported by `validate`.
    fn with_auth(mut self, auth: RegistryAuth) -> Self {
        if let Some(existing) = &self.registry_auth {
            if std::mem::discriminant(existing) != std::mem::discriminant(&auth) {
                self.conflicting_auth = true;
            }
        }
        self.registry_auth = Some(auth);
        self
    }
}

/// The execution substrate selected for a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Commands run directly on the executor host.
    Host,
    /// Commands run inside a container started from `DockerOpts::image`.
    Docker(DockerOpts),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Docker(_) => "docker",
        }
    }
}

/// Typed description of a requested runtime. Constructed once per Open call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub backend: Backend,
    /// Free-form metadata, not interpreted by the protocol.
    pub tags: BTreeMap<String, String>,
    /// Used by the control plane to select a matching executor.
    pub labels: BTreeSet<String>,
}

impl RuntimeConfig {
    pub fn host() -> Self {
        Self::with_backend(Backend::Host)
    }

    pub fn docker(opts: DockerOpts) -> Self {
        Self::with_backend(Backend::Docker(opts))
    }

    pub fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            tags: BTreeMap::new(),
            labels: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }

    #[must_use]
    pub fn with_tags<K, V>(mut self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: &str) -> Self {
        self.labels.insert(label.to_owned());
        self
    }

    #[must_use]
    pub fn with_labels<S: Into<String>>(mut self, labels: impl IntoIterator<Item = S>) -> Self {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    /// Check the variant invariants. Must pass before any Open call is issued.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.backend {
            Backend::Host => Ok(()),
            Backend::Docker(docker) => {
                if docker.image.trim().is_empty() {
                    return Err(ConfigError::EmptyImage);
                }
                if docker.conflicting_auth {
                    return Err(ConfigError::ConflictingAuth);
                }
                Ok(())
            }
        }
    }

    pub fn docker_opts(&self) -> Option<&DockerOpts> {
        match &self.backend {
            Backend::Docker(docker) => Some(docker),
            Backend::Host => None,
        }
    }

    /// The `name` tag, if set.
    pub fn display_name(&self) -> Option<&str> {
        self.tags.get(crate::NAME_TAG).map(String::as_str)
    }
}
