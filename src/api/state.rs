//! Shared request state: rule engine, regulator, preferences, users, sessions.

use anyhow::{Context, Result};
use std::{fmt, sync::Arc};
use tracing::info;

use super::session::SessionStore;
use crate::{
    access_control::AccessControl,
    config::Config,
    preferences::PreferenceAggregator,
    regulation::Regulator,
    storage::{AttemptStore, MemoryStore, PgStore, PreferenceStore},
    users::{FileUserBackend, UserBackend},
};

pub struct AppState {
    access_control: Arc<AccessControl>,
    regulator: Regulator,
    preferences: PreferenceAggregator,
    users: Arc<dyn UserBackend>,
    sessions: SessionStore,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("access_control", &self.access_control)
            .field("regulator", &self.regulator)
            .field("preferences", &self.preferences)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl AppState {
    #[must_use]
    pub fn new(
        access_control: Arc<AccessControl>,
        regulator: Regulator,
        preferences: PreferenceAggregator,
        users: Arc<dyn UserBackend>,
        sessions: SessionStore,
    ) -> Self {
        Self {
            access_control,
            regulator,
            preferences,
            users,
            sessions,
        }
    }

    /// Wire every component from a validated configuration.
    ///
    /// # Errors
    /// Returns an error if a rule is malformed, the users database cannot be
    /// loaded or the database is unreachable.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let access_control = AccessControl::new(&config.access_control)
            .context("Invalid access control configuration")?;

        let users: Arc<dyn UserBackend> = Arc::new(
            FileUserBackend::load(&config.authentication_backend.file.path)
                .context("Failed to load users database")?,
        );

        let state = match config.storage.dsn.as_deref() {
            Some(dsn) => {
                let store = PgStore::connect(dsn, config.storage.timeout)
                    .await
                    .context("Failed to connect to database")?;
                info!("Using PostgreSQL storage");
                Self::with_store(config, access_control, Arc::new(store), users)
            }
            None => {
                info!("No storage DSN configured, keeping attempts and preferences in memory");
                let store = MemoryStore::new(config.regulation.history_window());
                Self::with_store(config, access_control, Arc::new(store), users)
            }
        };

        Ok(state)
    }

    /// Assemble the state around an existing store and user backend.
    #[must_use]
    pub fn with_store<S>(
        config: &Config,
        access_control: AccessControl,
        store: Arc<S>,
        users: Arc<dyn UserBackend>,
    ) -> Self
    where
        S: AttemptStore + PreferenceStore + 'static,
    {
        let timeout = config.storage.timeout;
        Self::new(
            Arc::new(access_control),
            Regulator::new(store.clone(), config.regulation, timeout),
            PreferenceAggregator::new(store, timeout),
            users,
            SessionStore::new(&config.session),
        )
    }

    #[must_use]
    pub fn access_control(&self) -> &AccessControl {
        &self.access_control
    }

    #[must_use]
    pub fn regulator(&self) -> &Regulator {
        &self.regulator
    }

    #[must_use]
    pub fn preferences(&self) -> &PreferenceAggregator {
        &self.preferences
    }

    #[must_use]
    pub fn users(&self) -> &dyn UserBackend {
        self.users.as_ref()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}
