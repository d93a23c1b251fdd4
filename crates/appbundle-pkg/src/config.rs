//! Optional `appbundle.toml` configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the configuration file looked up in the bundle directory.
pub const CONFIG_FILE: &str = "appbundle.toml";

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings for one appbundle run.
///
/// Every field is optional; command line values take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Ruby interpreter written into shebangs and wrappers.
    #[serde(default)]
    pub ruby: Option<PathBuf>,

    /// Gem directories searched for installed gems.
    #[serde(default)]
    pub gem_path: Vec<PathBuf>,

    /// Gems to generate binstubs for.
    #[serde(default)]
    pub apps: Vec<String>,

    /// Write `.bat` wrappers next to each stub.
    #[serde(default)]
    pub windows_wrappers: Option<bool>,

    /// Copy `Gemfile.lock` and `.bundle/` into the installed gem.
    #[serde(default)]
    pub copy_bundle_env: Option<bool>,
}

impl Config {
    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has unknown keys.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `<dir>/appbundle.toml` if it exists, otherwise the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn discover(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = dir.as_ref().join(CONFIG_FILE);
        if path.is_file() {
            Self::from_path(path)
        } else {
            Ok(Self::default())
        }
    }
}
