//! Concurrent user preference lookup.
//!
//! Flow Overview:
//! 1) Three lookups run concurrently: preferred method, U2F device, TOTP secret.
//! 2) Each lookup owns exactly one field of the result; failures are pushed
//!    into a shared, lock-guarded list.
//! 3) Each lookup is bounded by a timeout; a timeout counts as a failure.
//!
//! Absence of data is never a failure: a user without a U2F device simply
//! reports `has_u2f = false`.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error};

use super::{Method, UserPreferences};
use crate::storage::{PreferenceStore, StorageError};

/// Which lookup of the aggregation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    PreferredMethod,
    U2fDevice,
    TotpSecret,
}

impl Lookup {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreferredMethod => "preferred_method",
            Self::U2fDevice => "u2f_device",
            Self::TotpSecret => "totp_secret",
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{lookup} lookup failed: {source}")]
    Storage {
        lookup: Lookup,
        #[source]
        source: StorageError,
    },
    #[error("{lookup} lookup timed out after {timeout:?}")]
    Timeout { lookup: Lookup, timeout: Duration },
}

impl AggregationError {
    #[must_use]
    pub fn lookup(&self) -> Lookup {
        match self {
            Self::Storage { lookup, .. } | Self::Timeout { lookup, .. } => *lookup,
        }
    }
}

#[derive(Clone)]
pub struct PreferenceAggregator {
    store: Arc<dyn PreferenceStore>,
    timeout: Duration,
}

impl fmt::Debug for PreferenceAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceAggregator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PreferenceAggregator {
    #[must_use]
    pub fn new(store: Arc<dyn PreferenceStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Load the preferences of `username`.
    ///
    /// The returned preferences always carry whatever the successful lookups
    /// found, even when the error list is non-empty.
    pub async fn load(&self, username: &str) -> (UserPreferences, Vec<AggregationError>) {
        let mut preferences = UserPreferences::default();
        let errors = Mutex::new(Vec::new());

        {
            let UserPreferences {
                method,
                has_totp,
                has_u2f,
            } = &mut preferences;

            let method_lookup = async {
                match self
                    .bounded(
                        Lookup::PreferredMethod,
                        self.store.load_preferred_method(username),
                    )
                    .await
                {
                    Ok(Some(stored)) => *method = stored,
                    Ok(None) => debug!("No preferred method stored for {username}"),
                    Err(err) => push_error(&errors, username, err),
                }
            };

            let u2f_lookup = async {
                match self
                    .bounded(Lookup::U2fDevice, self.store.load_u2f_device_handle(username))
                    .await
                {
                    Ok(device) => *has_u2f = device.is_some(),
                    Err(err) => push_error(&errors, username, err),
                }
            };

            let totp_lookup = async {
                match self
                    .bounded(Lookup::TotpSecret, self.store.load_totp_secret(username))
                    .await
                {
                    Ok(secret) => *has_totp = secret.is_some(),
                    Err(err) => push_error(&errors, username, err),
                }
            };

            tokio::join!(method_lookup, u2f_lookup, totp_lookup);
        }

        let errors = errors.into_inner().unwrap_or_else(PoisonError::into_inner);
        (preferences, errors)
    }

    /// Persist the preferred second-factor method of `username`.
    ///
    /// # Errors
    /// Returns `StorageError` if the store fails or does not answer in time.
    pub async fn save_method(&self, username: &str, method: Method) -> Result<(), StorageError> {
        match tokio::time::timeout(
            self.timeout,
            self.store.save_preferred_method(username, method),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StorageError::Backend(format!(
                "saving preferred method timed out after {:?}",
                self.timeout
            ))),
        }
    }

    async fn bounded<T, F>(&self, lookup: Lookup, future: F) -> Result<T, AggregationError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(AggregationError::Storage { lookup, source }),
            Err(_) => Err(AggregationError::Timeout {
                lookup,
                timeout: self.timeout,
            }),
        }
    }
}

fn push_error(errors: &Mutex<Vec<AggregationError>>, username: &str, err: AggregationError) {
    error!(
        lookup = %err.lookup(),
        "Failed to load user preferences for {username}: {err}"
    );
    errors
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(err);
}
