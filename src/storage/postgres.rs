//! PostgreSQL-backed store.
//!
//! Schema lives in `sql/schema.sql`. Every query runs inside a `db.query`
//! span so slow lookups show up in traces next to the request that issued them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::{str::FromStr, time::Duration};
use tracing::{info_span, Instrument};

use super::{AttemptRecord, AttemptStore, DeviceHandle, PreferenceStore, StorageError};
use crate::preferences::Method;

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool to `dsn`.
    ///
    /// # Errors
    /// Returns `StorageError::Backend` if the database is unreachable.
    pub async fn connect(dsn: &str, acquire_timeout: Duration) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .acquire_timeout(acquire_timeout)
            .test_before_acquire(true)
            .connect(dsn)
            .await?;
        Ok(Self::new(pool))
    }
}

fn query_span(operation: &'static str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation
    )
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn append_attempt(&self, record: &AttemptRecord) -> Result<(), StorageError> {
        let query = r"
            INSERT INTO authentication_logs (username, successful, attempted_at)
            VALUES ($1, $2, $3)
        ";
        sqlx::query(query)
            .bind(&record.username)
            .bind(record.success)
            .bind(record.timestamp)
            .execute(&self.pool)
            .instrument(query_span("INSERT"))
            .await?;
        Ok(())
    }

    async fn load_recent_attempts(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, StorageError> {
        let query = r"
            SELECT successful, attempted_at
            FROM authentication_logs
            WHERE username = $1 AND attempted_at >= $2
            ORDER BY attempted_at DESC, id DESC
        ";
        let rows = sqlx::query(query)
            .bind(username)
            .bind(since)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT"))
            .await?;

        rows.iter()
            .map(|row| -> Result<AttemptRecord, StorageError> {
                Ok(AttemptRecord {
                    username: username.to_string(),
                    timestamp: row.try_get("attempted_at")?,
                    success: row.try_get("successful")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PreferenceStore for PgStore {
    async fn load_preferred_method(&self, username: &str) -> Result<Option<Method>, StorageError> {
        let query = r"
            SELECT second_factor_method
            FROM user_preferences
            WHERE username = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT"))
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stored: String = row.try_get("second_factor_method")?;
        Method::from_str(&stored)
            .map(Some)
            .map_err(|err| StorageError::Decode(err.to_string()))
    }

    async fn save_preferred_method(
        &self,
        username: &str,
        method: Method,
    ) -> Result<(), StorageError> {
        let query = r"
            INSERT INTO user_preferences (username, second_factor_method, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (username) DO UPDATE
            SET second_factor_method = $2,
                updated_at = NOW()
        ";
        sqlx::query(query)
            .bind(username)
            .bind(method.as_str())
            .execute(&self.pool)
            .instrument(query_span("UPSERT"))
            .await?;
        Ok(())
    }

    async fn load_u2f_device_handle(
        &self,
        username: &str,
    ) -> Result<Option<DeviceHandle>, StorageError> {
        let query = r"
            SELECT key_handle, public_key
            FROM u2f_devices
            WHERE username = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT"))
            .await?;

        row.map(|row| -> Result<DeviceHandle, StorageError> {
            Ok(DeviceHandle {
                key_handle: row.try_get("key_handle")?,
                public_key: row.try_get("public_key")?,
            })
        })
        .transpose()
    }

    async fn load_totp_secret(&self, username: &str) -> Result<Option<SecretString>, StorageError> {
        let query = r"
            SELECT secret
            FROM totp_secrets
            WHERE username = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT"))
            .await?;

        row.map(|row| -> Result<SecretString, StorageError> {
            let secret: String = row.try_get("secret")?;
            Ok(SecretString::from(secret))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn unreachable_store() -> Result<PgStore> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://vigil@127.0.0.1:1/vigil")?;
        Ok(PgStore::new(pool))
    }

    #[tokio::test]
    async fn unreachable_database_is_backend_error() -> Result<()> {
        let store = unreachable_store()?;
        let result = store.load_recent_attempts("john", Utc::now()).await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_database_is_not_absence() -> Result<()> {
        let store = unreachable_store()?;
        assert!(store.load_preferred_method("john").await.is_err());
        assert!(store.load_u2f_device_handle("john").await.is_err());
        assert!(store.load_totp_secret("john").await.is_err());
        Ok(())
    }

    #[test]
    fn sqlx_errors_map_to_storage_errors() {
        let err = StorageError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::Backend(_)));

        let err = StorageError::from(sqlx::Error::ColumnDecode {
            index: "secret".to_string(),
            source: "invalid utf-8".into(),
        });
        assert!(matches!(err, StorageError::Decode(_)));
    }
}
