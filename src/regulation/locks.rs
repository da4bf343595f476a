//! Per-username critical sections.
//!
//! The registry only keeps weak references: a username's lock lives as long
//! as someone holds or waits on it, and dead entries are swept whenever a new
//! username is registered.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(crate) struct UserLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl UserLocks {
    /// Wait for exclusive access to `username`.
    pub(crate) async fn acquire(&self, username: &str) -> OwnedMutexGuard<()> {
        self.lock_for(username).lock_owned().await
    }

    fn lock_for(&self, username: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(lock) = locks.get(username).and_then(Weak::upgrade) {
            return lock;
        }

        locks.retain(|_, lock| lock.strong_count() > 0);

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(username.to_string(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
