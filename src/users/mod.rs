//! First-factor user backends.

mod file;

pub use file::{hash_password, FileUserBackend};

use async_trait::async_trait;
use secrecy::SecretString;
use std::path::PathBuf;
use thiserror::Error;

/// Profile data exposed to protected applications after authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserDetails {
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub groups: Vec<String>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to read users database {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse users database: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("user '{username}' has an invalid password hash: {reason}")]
    InvalidHash { username: String, reason: String },
    #[error("password verification failed: {0}")]
    Verification(String),
}

/// Credential and profile source for first-factor authentication.
#[async_trait]
pub trait UserBackend: Send + Sync {
    /// `Ok(false)` for unknown users as well as wrong passwords.
    ///
    /// # Errors
    /// Returns `BackendError` when the check itself could not run.
    async fn check_password(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<bool, BackendError>;

    /// # Errors
    /// Returns `BackendError` when the backend is unavailable.
    async fn get_details(&self, username: &str) -> Result<Option<UserDetails>, BackendError>;
}
