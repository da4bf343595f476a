//! Configuration file loading and validation.
//!
//! The configuration is a single TOML file:
//!
//! ```toml
//! [access_control]
//! default_policy = "deny"
//!
//! [[access_control.rules]]
//! domain = "public.example.com"
//! policy = "bypass"
//!
//! [regulation]
//! max_retries = 3
//! find_time = "2m"
//! ban_time = "5m"
//!
//! [session]
//! ttl = "1h"
//! secure = true
//!
//! [storage]
//! dsn = "postgres://vigil@localhost/vigil"
//! timeout = "5s"
//!
//! [authentication_backend.file]
//! path = "/etc/vigil/users.toml"
//! ```
//!
//! Everything is validated before the server starts; an invalid file aborts
//! startup.

pub mod duration;

use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

use crate::{access_control::AccessControlConfig, regulation::RegulationConfig};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub access_control: AccessControlConfig,
    pub regulation: RegulationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub authentication_backend: AuthenticationBackendConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
    #[serde(with = "duration")]
    pub ttl: Duration,
    /// Mark the session cookie `Secure`; enable whenever the portal is served over TLS.
    pub secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            secure: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// PostgreSQL DSN; attempts and preferences stay in memory when unset.
    pub dsn: Option<String>,
    /// Upper bound for every storage call.
    #[serde(with = "duration")]
    pub timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            timeout: DEFAULT_STORAGE_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationBackendConfig {
    pub file: FileBackendConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileBackendConfig {
    pub path: PathBuf,
}

impl Config {
    /// Read, parse and validate the configuration file at `path`.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading config file");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::parse(&content)?;
        debug!(
            rules = config.access_control.rules.len(),
            persistent_storage = config.storage.dsn.is_some(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    ///
    /// # Errors
    /// Returns `ConfigError` if the text is not valid TOML or fails validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));

        if self.regulation.max_retries < 1 {
            return invalid("regulation.max_retries must be at least 1");
        }
        if self.regulation.find_time.is_zero() {
            return invalid("regulation.find_time must be greater than zero");
        }
        if self.regulation.ban_time.is_zero() {
            return invalid("regulation.ban_time must be greater than zero");
        }
        if self.session.ttl.is_zero() {
            return invalid("session.ttl must be greater than zero");
        }
        if self.storage.timeout.is_zero() {
            return invalid("storage.timeout must be greater than zero");
        }
        if self
            .storage
            .dsn
            .as_deref()
            .is_some_and(|dsn| dsn.trim().is_empty())
        {
            return invalid("storage.dsn must not be empty when set");
        }
        if self
            .authentication_backend
            .file
            .path
            .as_os_str()
            .is_empty()
        {
            return invalid("authentication_backend.file.path must not be empty");
        }

        Ok(())
    }
}
