use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// Options shared by Import and Export.
///
/// An empty `dest` preserves each source's relative path on the
/// destination side. A `dest` ending in `/` names a directory to copy into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOpts {
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl TransferOpts {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_dest(mut self, dest: &str) -> Self {
        self.dest = dest.to_owned();
        self
    }

    #[must_use]
    pub fn with_excludes<S: Into<String>>(mut self, excludes: impl IntoIterator<Item = S>) -> Self {
        self.excludes.extend(excludes.into_iter().map(Into::into));
        self
    }

    /// Validate the request for a given source. Both sides must be relative.
    pub fn validate(&self, src: &str) -> Result<(), ConfigError> {
        if src.is_empty() {
            return Err(ConfigError::InvalidPath {
                path: String::new(),
                reason: "source must not be empty",
            });
        }
        validate_relative_path(src)?;
        if !self.dest.is_empty() {
            validate_relative_path(&self.dest)?;
        }
        Ok(())
    }
}

/// Reject absolute paths and paths that climb out of their root with `..`.
pub fn validate_relative_path(path: &str) -> Result<(), ConfigError> {
    let p = Path::new(path);
    if p.is_absolute() || path.starts_with('/') {
        return Err(ConfigError::InvalidPath {
            path: path.to_owned(),
            reason: "must be relative",
        });
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ConfigError::InvalidPath {
            path: path.to_owned(),
            reason: "must not contain '..'",
        });
    }
    Ok(())
}
