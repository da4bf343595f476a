//! Storage collaborators consumed by regulation and the preference aggregator.
//!
//! Absence of optional data (no preferred method, no U2F device, no TOTP
//! secret) is `Ok(None)`; `StorageError` is reserved for real failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use thiserror::Error;

use crate::preferences::Method;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// One first-factor authentication attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptRecord {
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

impl AttemptRecord {
    #[must_use]
    pub fn new(username: impl Into<String>, success: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            timestamp,
            success,
        }
    }
}

/// Registered U2F device of a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    pub key_handle: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to decode stored value: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Decode(err.to_string())
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

/// Append-only authentication history.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// # Errors
    /// Returns `StorageError` if the record could not be persisted.
    async fn append_attempt(&self, record: &AttemptRecord) -> Result<(), StorageError>;

    /// Attempts of `username` at or after `since`, newest first.
    ///
    /// # Errors
    /// Returns `StorageError` if the history could not be read.
    async fn load_recent_attempts(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, StorageError>;
}

/// Per-user second-factor configuration.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// # Errors
    /// Returns `StorageError` on backend failure or an unknown stored method.
    async fn load_preferred_method(&self, username: &str) -> Result<Option<Method>, StorageError>;

    /// # Errors
    /// Returns `StorageError` if the preference could not be persisted.
    async fn save_preferred_method(&self, username: &str, method: Method)
        -> Result<(), StorageError>;

    /// # Errors
    /// Returns `StorageError` on backend failure.
    async fn load_u2f_device_handle(
        &self,
        username: &str,
    ) -> Result<Option<DeviceHandle>, StorageError>;

    /// # Errors
    /// Returns `StorageError` on backend failure.
    async fn load_totp_secret(&self, username: &str) -> Result<Option<SecretString>, StorageError>;
}
