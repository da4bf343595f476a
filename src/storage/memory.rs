//! In-process store, used when no database DSN is configured and in tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::{collections::HashMap, time::Duration};
use tokio::sync::RwLock;

use super::{AttemptRecord, AttemptStore, DeviceHandle, PreferenceStore, StorageError};
use crate::preferences::Method;

/// Attempts older than `retention` relative to the newest append are dropped,
/// and usernames left without attempts are forgotten.
#[derive(Debug)]
pub struct MemoryStore {
    retention: TimeDelta,
    attempts: RwLock<HashMap<String, Vec<AttemptRecord>>>,
    preferred_methods: RwLock<HashMap<String, Method>>,
    u2f_devices: RwLock<HashMap<String, DeviceHandle>>,
    totp_secrets: RwLock<HashMap<String, SecretString>>,
}

impl MemoryStore {
    /// `retention` should cover the regulation history window
    /// (`find_time + ban_time`).
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
            attempts: RwLock::default(),
            preferred_methods: RwLock::default(),
            u2f_devices: RwLock::default(),
            totp_secrets: RwLock::default(),
        }
    }

    /// Number of usernames with attempts still held.
    pub async fn tracked_usernames(&self) -> usize {
        self.attempts.read().await.len()
    }

    pub async fn set_u2f_device(&self, username: &str, device: DeviceHandle) {
        self.u2f_devices
            .write()
            .await
            .insert(username.to_string(), device);
    }

    pub async fn set_totp_secret(&self, username: &str, secret: SecretString) {
        self.totp_secrets
            .write()
            .await
            .insert(username.to_string(), secret);
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn append_attempt(&self, record: &AttemptRecord) -> Result<(), StorageError> {
        let horizon = record
            .timestamp
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut attempts = self.attempts.write().await;
        attempts.retain(|_, history| {
            history.retain(|attempt| attempt.timestamp >= horizon);
            !history.is_empty()
        });
        attempts
            .entry(record.username.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load_recent_attempts(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, StorageError> {
        let attempts = self.attempts.read().await;
        let mut recent: Vec<AttemptRecord> = attempts
            .get(username)
            .map(|history| {
                history
                    .iter()
                    .filter(|record| record.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // Equal timestamps keep insertion order, so the last write ends up first.
        recent.sort_by_key(|record| record.timestamp);
        recent.reverse();
        Ok(recent)
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn load_preferred_method(&self, username: &str) -> Result<Option<Method>, StorageError> {
        Ok(self.preferred_methods.read().await.get(username).copied())
    }

    async fn save_preferred_method(
        &self,
        username: &str,
        method: Method,
    ) -> Result<(), StorageError> {
        self.preferred_methods
            .write()
            .await
            .insert(username.to_string(), method);
        Ok(())
    }

    async fn load_u2f_device_handle(
        &self,
        username: &str,
    ) -> Result<Option<DeviceHandle>, StorageError> {
        Ok(self.u2f_devices.read().await.get(username).cloned())
    }

    async fn load_totp_secret(&self, username: &str) -> Result<Option<SecretString>, StorageError> {
        Ok(self
            .totp_secrets
            .read()
            .await
            .get(username)
            .map(|secret| SecretString::from(secret.expose_secret().to_owned())))
    }
}
