//! Per-scope exclusive locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::resource::Scope;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on {scope}")]
    Timeout { scope: String, waited: Duration },
}

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// Serializes sync passes per scope. Passes over different scopes run in
/// parallel.
///
/// A scope is only tracked while a pass holds or waits for it.
#[derive(Default)]
pub struct ScopeLocks {
    locks: Arc<StdMutex<LockMap>>,
}

/// Held for the duration of a pass; the lock is released on drop.
pub struct ScopeGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<StdMutex<LockMap>>,
}

impl ScopeGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_idle(&mut lock_map(&self.locks), &self.key);
        debug!(scope = %self.key, "Released scope lock");
    }
}

fn lock_map(locks: &StdMutex<LockMap>) -> MutexGuard<'_, LockMap> {
    // The map stays consistent even if a holder panicked
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forgets `key` when nobody holds or waits for it.
fn release_idle(map: &mut LockMap, key: &str) {
    if map.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
        map.remove(key);
    }
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = lock_map(&self.locks);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Waits for the scope lock.
    pub async fn lock(&self, scope: &Scope) -> ScopeGuard {
        let key = scope.lock_key();
        let guard = self.entry(&key).lock_owned().await;
        debug!(scope = %key, "Acquired scope lock");
        ScopeGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Waits at most `timeout` for the scope lock.
    pub async fn lock_timeout(
        &self,
        scope: &Scope,
        timeout: Duration,
    ) -> Result<ScopeGuard, LockError> {
        match tokio::time::timeout(timeout, self.lock(scope)).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                self.forget_idle(scope);
                Err(LockError::Timeout {
                    scope: scope.lock_key(),
                    waited: timeout,
                })
            }
        }
    }

    /// Drops the scope entry left behind by an abandoned wait.
    pub(crate) fn forget_idle(&self, scope: &Scope) {
        release_idle(&mut lock_map(&self.locks), &scope.lock_key());
    }

    /// Whether a pass currently holds the scope.
    pub fn is_locked(&self, scope: &Scope) -> bool {
        lock_map(&self.locks)
            .get(&scope.lock_key())
            .is_some_and(|m| m.try_lock().is_err())
    }

    /// Number of scopes currently held or waited for.
    pub fn tracked(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let locks = ScopeLocks::new();
        let scope = Scope::new("vpc", "v1");
        {
            let guard = locks.lock(&scope).await;
            assert_eq!(guard.key(), "vpc/v1");
            assert!(locks.is_locked(&scope));
        }
        assert!(!locks.is_locked(&scope));
    }

    #[tokio::test]
    async fn test_released_scopes_are_forgotten() {
        let locks = ScopeLocks::new();
        let scope = Scope::new("vpc", "v1");
        assert!(!locks.is_locked(&scope));
        assert_eq!(locks.tracked(), 0);

        let guard = locks.lock(&scope).await;
        assert_eq!(locks.tracked(), 1);
        drop(guard);
        assert_eq!(locks.tracked(), 0);

        for i in 0..10 {
            let _guard = locks.lock(&Scope::new("vpc", format!("v{}", i))).await;
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_waiter_keeps_scope_tracked() {
        let locks = Arc::new(ScopeLocks::new());
        let scope = Scope::new("vpc", "v1");
        let held = locks.lock(&scope).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            let scope = scope.clone();
            tokio::spawn(async move {
                let guard = locks.lock(&scope).await;
                guard.key().to_string()
            })
        };
        tokio::task::yield_now().await;

        // The waiter still needs the entry after the holder leaves
        drop(held);
        assert_eq!(waiter.await.unwrap(), "vpc/v1");
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let locks = ScopeLocks::new();
        let _a = locks.lock(&Scope::new("vpc", "a")).await;
        let b = locks
            .lock_timeout(&Scope::new("vpc", "b"), Duration::from_millis(10))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let locks = ScopeLocks::new();
        let scope = Scope::new("vpc", "v1");
        let held = locks.lock(&scope).await;
        let err = locks
            .lock_timeout(&scope, Duration::from_secs(5))
            .await
            .err();
        assert_eq!(
            err,
            Some(LockError::Timeout {
                scope: "vpc/v1".into(),
                waited: Duration::from_secs(5)
            })
        );
        drop(held);
        assert_eq!(locks.tracked(), 0);
    }
}
