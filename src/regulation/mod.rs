//! Brute-force regulation of first-factor logins.
//!
//! Flow Overview:
//! 1) Every first-factor attempt is appended to the attempt store.
//! 2) A username is banned once `max_retries` consecutive failures fall within
//!    `find_time` of the most recent one; the ban ends `ban_time` after that
//!    failure.
//! 3) A success ends the failure streak, even inside the window.
//!
//! Ban state is never persisted: it is recomputed from history on every check,
//! so bans lapse on their own. Checks and appends for one username are
//! serialized through a per-username lock so concurrent failing logins cannot
//! both observe "not banned".

mod locks;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, warn};

use crate::{
    config::duration,
    storage::{AttemptRecord, AttemptStore, StorageError},
};
use locks::UserLocks;

/// `[regulation]` section of the configuration file. Every parameter is required.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegulationConfig {
    pub max_retries: u32,
    #[serde(with = "duration")]
    pub find_time: Duration,
    #[serde(with = "duration")]
    pub ban_time: Duration,
}

impl RegulationConfig {
    /// How far back history can still influence a ban: `find_time + ban_time`.
    #[must_use]
    pub fn history_window(&self) -> Duration {
        self.find_time.saturating_add(self.ban_time)
    }
}

/// Derived ban status of a username.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BanState {
    pub banned: bool,
    pub banned_until: Option<DateTime<Utc>>,
}

impl BanState {
    #[must_use]
    pub const fn not_banned() -> Self {
        Self {
            banned: false,
            banned_until: None,
        }
    }

    #[must_use]
    pub const fn until(banned_until: DateTime<Utc>) -> Self {
        Self {
            banned: true,
            banned_until: Some(banned_until),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegulationError {
    #[error("failed to load authentication history: {0}")]
    History(#[source] StorageError),
    #[error("authentication history lookup timed out after {0:?}")]
    Timeout(Duration),
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Compute the ban state from `history`, ordered newest first.
///
/// Attempts later than `now` are ignored.
#[must_use]
pub fn ban_state(
    history: &[AttemptRecord],
    config: &RegulationConfig,
    now: DateTime<Utc>,
) -> BanState {
    let mut failures = history
        .iter()
        .filter(|attempt| attempt.timestamp <= now)
        .take_while(|attempt| !attempt.success);

    let Some(trigger) = failures.next() else {
        return BanState::not_banned();
    };

    let window_start = trigger
        .timestamp
        .checked_sub_signed(delta(config.find_time))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let streak = 1 + failures
        .take_while(|attempt| attempt.timestamp >= window_start)
        .count();

    if streak < config.max_retries as usize {
        return BanState::not_banned();
    }

    let banned_until = trigger
        .timestamp
        .checked_add_signed(delta(config.ban_time))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    if now < banned_until {
        BanState::until(banned_until)
    } else {
        BanState::not_banned()
    }
}

pub struct Regulator {
    store: Arc<dyn AttemptStore>,
    config: RegulationConfig,
    timeout: Duration,
    locks: UserLocks,
}

impl fmt::Debug for Regulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Regulator")
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Regulator {
    /// `timeout` bounds every store call made by the regulator.
    #[must_use]
    pub fn new(store: Arc<dyn AttemptStore>, config: RegulationConfig, timeout: Duration) -> Self {
        Self {
            store,
            config,
            timeout,
            locks: UserLocks::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegulationConfig {
        &self.config
    }

    /// Enter the critical section of `username`.
    ///
    /// Hold the guard across the whole login (ban check, credential check,
    /// attempt record) so concurrent logins for the same username run one
    /// after the other.
    pub async fn lock(&self, username: &str) -> RegulationGuard<'_> {
        let lock = self.locks.acquire(username).await;
        RegulationGuard {
            regulator: self,
            username: username.to_string(),
            _lock: lock,
        }
    }

    /// # Errors
    /// Returns `RegulationError` if the history cannot be read; callers must
    /// then treat the user as not verified.
    pub async fn is_banned(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<BanState, RegulationError> {
        self.lock(username).await.is_banned(now).await
    }

    /// Append an attempt. Store failures are logged and the record dropped.
    pub async fn record_attempt(&self, username: &str, success: bool, now: DateTime<Utc>) {
        self.lock(username)
            .await
            .record_attempt(success, now)
            .await;
    }

    async fn check(&self, username: &str, now: DateTime<Utc>) -> Result<BanState, RegulationError> {
        // Far enough back that a ban triggered at the edge of find_time is
        // still visible for its full ban_time.
        let lookback = delta(self.config.history_window());
        let since = now
            .checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let history =
            match tokio::time::timeout(self.timeout, self.store.load_recent_attempts(username, since))
                .await
            {
                Ok(Ok(history)) => history,
                Ok(Err(err)) => {
                    error!("Failed to load authentication history for {username}: {err}");
                    return Err(RegulationError::History(err));
                }
                Err(_) => {
                    error!(
                        "Timed out loading authentication history for {username} after {:?}",
                        self.timeout
                    );
                    return Err(RegulationError::Timeout(self.timeout));
                }
            };

        let state = ban_state(&history, &self.config, now);
        if let Some(until) = state.banned_until {
            warn!("User {username} is banned until {until}");
        }
        Ok(state)
    }

    async fn append(&self, username: &str, success: bool, now: DateTime<Utc>) {
        let record = AttemptRecord::new(username, success, now);
        match tokio::time::timeout(self.timeout, self.store.append_attempt(&record)).await {
            Ok(Ok(())) => debug!(success, "Recorded authentication attempt for {username}"),
            Ok(Err(err)) => {
                error!("Failed to record authentication attempt for {username}: {err}");
            }
            Err(_) => error!(
                "Timed out recording authentication attempt for {username} after {:?}",
                self.timeout
            ),
        }
    }
}

/// Exclusive access to one username's regulation state.
pub struct RegulationGuard<'a> {
    regulator: &'a Regulator,
    username: String,
    _lock: OwnedMutexGuard<()>,
}

impl RegulationGuard<'_> {
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// # Errors
    /// Returns `RegulationError` if the history cannot be read.
    pub async fn is_banned(&self, now: DateTime<Utc>) -> Result<BanState, RegulationError> {
        self.regulator.check(&self.username, now).await
    }

    pub async fn record_attempt(&self, success: bool, now: DateTime<Utc>) {
        self.regulator.append(&self.username, success, now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn minutes(m: i64) -> TimeDelta {
        TimeDelta::minutes(m)
    }

    fn seconds(s: i64) -> TimeDelta {
        TimeDelta::seconds(s)
    }

    fn config() -> RegulationConfig {
        RegulationConfig {
            max_retries: 3,
            find_time: Duration::from_secs(10 * 60),
            ban_time: Duration::from_secs(5 * 60),
        }
    }

    fn regulator(store: Arc<dyn AttemptStore>) -> Regulator {
        Regulator::new(store, config(), Duration::from_secs(1))
    }

    fn memory_regulator() -> Regulator {
        regulator(Arc::new(MemoryStore::new(config().history_window())))
    }

    #[test]
    fn history_window_spans_find_and_ban_time() {
        assert_eq!(config().history_window(), Duration::from_secs(15 * 60));
        let unbounded = RegulationConfig {
            ban_time: Duration::MAX,
            ..config()
        };
        assert_eq!(unbounded.history_window(), Duration::MAX);
    }

    #[tokio::test]
    async fn ban_triggers_and_lapses() {
        let regulator = memory_regulator();
        let start = t0();
        for offset in [minutes(0), minutes(1), minutes(2)] {
            regulator.record_attempt("john", false, start + offset).await;
        }

        let state = regulator
            .is_banned("john", start + minutes(2) + seconds(1))
            .await;
        assert!(matches!(
            state,
            Ok(BanState { banned: true, banned_until: Some(until) }) if until == start + minutes(7)
        ));

        let state = regulator.is_banned("john", start + minutes(8)).await;
        assert!(matches!(state, Ok(state) if state == BanState::not_banned()));
    }

    #[tokio::test]
    async fn success_resets_the_streak() {
        let regulator = memory_regulator();
        let start = t0();
        regulator.record_attempt("john", false, start).await;
        regulator
            .record_attempt("john", false, start + minutes(1))
            .await;
        regulator
            .record_attempt("john", true, start + minutes(1) + seconds(30))
            .await;
        regulator
            .record_attempt("john", false, start + minutes(2))
            .await;

        let state = regulator
            .is_banned("john", start + minutes(2) + seconds(1))
            .await;
        assert!(matches!(state, Ok(state) if !state.banned));
    }

    #[tokio::test]
    async fn bans_are_per_username() {
        let regulator = memory_regulator();
        let start = t0();
        for offset in [minutes(0), minutes(1), minutes(2)] {
            regulator.record_attempt("john", false, start + offset).await;
        }

        let state = regulator.is_banned("harry", start + minutes(3)).await;
        assert!(matches!(state, Ok(state) if !state.banned));
    }

    #[test]
    fn failures_outside_find_time_do_not_count() {
        let start = t0();
        let history = vec![
            AttemptRecord::new("john", false, start + minutes(12)),
            AttemptRecord::new("john", false, start + minutes(11)),
            AttemptRecord::new("john", false, start),
        ];
        let state = ban_state(&history, &config(), start + minutes(12) + seconds(1));
        assert!(!state.banned);
    }

    #[test]
    fn ban_outlasts_find_time() {
        let config = RegulationConfig {
            max_retries: 2,
            find_time: Duration::from_secs(60),
            ban_time: Duration::from_secs(60 * 60),
        };
        let start = t0();
        let history = vec![
            AttemptRecord::new("john", false, start + seconds(30)),
            AttemptRecord::new("john", false, start),
        ];
        let state = ban_state(&history, &config, start + minutes(45));
        assert_eq!(state, BanState::until(start + seconds(30) + minutes(60)));
    }

    #[test]
    fn single_retry_bans_on_first_failure() {
        let config = RegulationConfig {
            max_retries: 1,
            ..config()
        };
        let start = t0();
        let history = vec![AttemptRecord::new("john", false, start)];
        assert!(ban_state(&history, &config, start + seconds(1)).banned);
    }

    #[test]
    fn empty_history_is_not_banned() {
        assert_eq!(ban_state(&[], &config(), t0()), BanState::not_banned());
    }

    struct BrokenStore;

    #[async_trait]
    impl AttemptStore for BrokenStore {
        async fn append_attempt(&self, _record: &AttemptRecord) -> Result<(), StorageError> {
            Err(StorageError::Backend("connection refused".to_string()))
        }

        async fn load_recent_attempts(
            &self,
            _username: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<AttemptRecord>, StorageError> {
            Err(StorageError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn unreadable_history_is_an_error() {
        let regulator = regulator(Arc::new(BrokenStore));
        let state = regulator.is_banned("john", t0()).await;
        assert!(matches!(state, Err(RegulationError::History(_))));
    }

    #[tokio::test]
    async fn record_failure_does_not_propagate() {
        let regulator = regulator(Arc::new(BrokenStore));
        regulator.record_attempt("john", false, t0()).await;
    }

    struct StalledStore;

    #[async_trait]
    impl AttemptStore for StalledStore {
        async fn append_attempt(&self, _record: &AttemptRecord) -> Result<(), StorageError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn load_recent_attempts(
            &self,
            _username: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<AttemptRecord>, StorageError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn slow_history_times_out() {
        let regulator = Regulator::new(
            Arc::new(StalledStore),
            config(),
            Duration::from_millis(50),
        );
        let state = regulator.is_banned("john", t0()).await;
        assert!(matches!(state, Err(RegulationError::Timeout(_))));
        regulator.record_attempt("john", false, t0()).await;
    }

    #[tokio::test]
    async fn concurrent_failures_cannot_pass_the_threshold() {
        // Each login checks then records while holding the guard, so with
        // max_retries = 3 at most three failing logins get past the check.
        let regulator = Arc::new(memory_regulator());
        let now = t0();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let regulator = regulator.clone();
            handles.push(tokio::spawn(async move {
                let guard = regulator.lock("john").await;
                let Ok(state) = guard.is_banned(now).await else {
                    return false;
                };
                if state.banned {
                    return false;
                }
                tokio::task::yield_now().await;
                guard.record_attempt(false, now).await;
                true
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if matches!(handle.await, Ok(true)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 3);
    }
}
