use knita_schema::{
    Backend, ConfigError, DockerOpts, ExecOpts, PullStrategy, RegistryAuth, RuntimeConfig,
    SystemInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Backend selection as carried by Open. Internally tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum WireBackend {
    Host,
    Docker {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pull_strategy: Option<PullStrategy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<DockerAuth>,
    },
}

/// Registry auth, externally tagged: exactly one variant key is present.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum DockerAuth {
    Basic {
        username: String,
        password: String,
    },
    AwsEcr {
        region: String,
        aws_access_key_id: String,
        aws_secret_key: String,
    },
}

impl std::fmt::Debug for DockerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Basic { .. } => "DockerAuth::Basic(<redacted>)",
            Self::AwsEcr { .. } => "DockerAuth::AwsEcr(<redacted>)",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOpts {
    pub backend: WireBackend,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl From<&RuntimeConfig> for OpenOpts {
    fn from(config: &RuntimeConfig) -> Self {
        let backend = match &config.backend {
            Backend::Host => WireBackend::Host,
            Backend::Docker(docker) => WireBackend::Docker {
                image: docker.image.clone(),
                pull_strategy: docker.pull_strategy,
                auth: docker.registry_auth.as_ref().map(DockerAuth::from),
            },
        };
        Self {
            backend,
            tags: config.tags.clone(),
            labels: config.labels.iter().cloned().collect(),
        }
    }
}

impl From<&RegistryAuth> for DockerAuth {
    fn from(auth: &RegistryAuth) -> Self {
        match auth {
            RegistryAuth::Basic { username, password } => Self::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            RegistryAuth::AwsEcr {
                region,
                access_key_id,
                secret_key,
            } => Self::AwsEcr {
                region: region.clone(),
                aws_access_key_id: access_key_id.clone(),
                aws_secret_key: secret_key.clone(),
            },
        }
    }
}

impl TryFrom<&OpenOpts> for RuntimeConfig {
    type Error = ConfigError;

    fn try_from(opts: &OpenOpts) -> Result<Self, Self::Error> {
        let backend = match &opts.backend {
            WireBackend::Host => Backend::Host,
            WireBackend::Docker {
                image,
                pull_strategy,
                auth,
            } => {
                let mut docker = DockerOpts::new(image.clone());
                docker.pull_strategy = *pull_strategy;
                docker.registry_auth = auth.as_ref().map(|a| match a {
                    DockerAuth::Basic { username, password } => RegistryAuth::Basic {
                        username: username.clone(),
                        password: password.clone(),
                    },
                    DockerAuth::AwsEcr {
                        region,
                        aws_access_key_id,
                        aws_secret_key,
                    } => RegistryAuth::AwsEcr {
                        region: region.clone(),
                        access_key_id: aws_access_key_id.clone(),
                        secret_key: aws_secret_key.clone(),
                    },
                });
                Backend::Docker(docker)
            }
        };
        let config = RuntimeConfig {
            backend,
            tags: opts.tags.clone(),
            labels: opts.labels.iter().cloned().collect::<BTreeSet<_>>(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub build_id: String,
    pub opts: OpenOpts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenResponse {
    pub runtime_id: String,
    pub work_directory: String,
    pub system_info: SystemInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub runtime_id: String,
    pub opts: ExecOpts,
}

/// Body of both Import and Export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub runtime_id: String,
    pub src_path: String,
    #[serde(default)]
    pub dest_path: String,
    #[serde(default)]
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub runtime_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn wire(config: &RuntimeConfig) -> Value {
        serde_json::to_value(OpenOpts::from(config)).unwrap()
    }

    #[test]
    fn host_backend_has_only_a_type() {
        let value = wire(&RuntimeConfig::host().with_tag("name", "lint"));
        assert_eq!(value["backend"], json!({"type": "host"}));
        assert_eq!(value["tags"]["name"], "lint");
    }

    #[test]
    fn docker_without_auth_omits_auth() {
        let value = wire(&RuntimeConfig::docker(DockerOpts::new("alpine")));
        assert_eq!(value["backend"], json!({"type": "docker", "image": "alpine"}));
    }

    #[test]
    fn docker_basic_auth_carries_exactly_that_variant() {
        let config = RuntimeConfig::docker(
            DockerOpts::new("alpine")
                .with_pull_strategy(PullStrategy::Never)
                .with_basic_auth("ci", "pw"),
        );
        let value = wire(&config);
        let auth = value["backend"]["auth"].as_object().unwrap();
        assert_eq!(auth.len(), 1);
        assert_eq!(auth["basic"], json!({"username": "ci", "password": "pw"}));
        assert_eq!(value["backend"]["pull_strategy"], "never");
    }

    #[test]
    fn docker_ecr_auth_carries_exactly_that_variant() {
        let config = RuntimeConfig::docker(
            DockerOpts::new("alpine").with_aws_ecr_auth("us-east-1", "AKIA", "s3cr3t"),
        );
        let value = wire(&config);
        let auth = value["backend"]["auth"].as_object().unwrap();
        assert_eq!(auth.len(), 1);
        assert_eq!(auth["aws_ecr"]["region"], "us-east-1");
        assert_eq!(auth["aws_ecr"]["aws_access_key_id"], "AKIA");
    }

    #[test]
    fn wire_with_two_auth_keys_is_rejected() {
        let body = json!({
            "backend": {
                "type": "docker",
                "image": "alpine",
                "auth": {
                    "basic": {"username": "u", "password": "p"},
                    "aws_ecr": {"region": "r", "aws_access_key_id": "a", "aws_secret_key": "s"}
                }
            }
        });
        assert!(serde_json::from_value::<OpenOpts>(body).is_err());
    }

    #[test]
    fn wire_converts_back_to_config() {
        let config = RuntimeConfig::docker(
            DockerOpts::new("rust:1.80").with_basic_auth("u", "p"),
        )
        .with_label("linux");
        let opts = OpenOpts::from(&config);
        let json = serde_json::to_string(&opts).unwrap();
        let parsed: OpenOpts = serde_json::from_str(&json).unwrap();
        let back = RuntimeConfig::try_from(&parsed).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn wire_docker_with_empty_image_fails_validation() {
        let opts = OpenOpts {
            backend: WireBackend::Docker {
                image: String::new(),
                pull_strategy: None,
                auth: None,
            },
            tags: BTreeMap::new(),
            labels: Vec::new(),
        };
        assert!(matches!(
            RuntimeConfig::try_from(&opts),
            Err(ConfigError::EmptyImage)
        ));
    }

    #[test]
    fn unknown_backend_type_is_rejected() {
        let body = json!({"backend": {"type": "firecracker"}});
        assert!(serde_json::from_value::<OpenOpts>(body).is_err());
    }

    #[test]
    fn auth_debug_is_redacted() {
        let auth = DockerAuth::Basic {
            username: "u".to_owned(),
            password: "hunter2".to_owned(),
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }
}
