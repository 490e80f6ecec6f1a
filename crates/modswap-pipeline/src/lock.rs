//! Exclusive deployment locks keyed by `(environment, module)`.
//!
//! A `LockHandle` releases its lock when dropped, so every exit path out
//! of a pipeline run (success, failure, `?`, panic unwind, cancellation)
//! gives the lock back.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use modswap_fleet::{Environment, ModuleDeploymentRequest};

/// Identity of a deployment lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub environment: Environment,
    pub module: String,
}

impl LockKey {
    pub fn new(environment: Environment, module: &str) -> Self {
        Self {
            environment,
            module: module.to_string(),
        }
    }

    pub fn for_request(request: &ModuleDeploymentRequest) -> Self {
        Self::new(request.environment, &request.module_name)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.module)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: LockKey, waited: Duration },

    #[error("cancelled while waiting for lock {0}")]
    Cancelled(LockKey),
}

/// A held lock. Dropping it releases the lock.
pub struct LockHandle {
    key: LockKey,
    ttl: Duration,
    acquired_at: Instant,
    _guard: Box<dyn Any + Send + Sync>,
}

impl LockHandle {
    /// Wrap whatever object keeps the underlying lock alive.
    pub fn new(key: LockKey, ttl: Duration, guard: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            key,
            ttl,
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.held_for() > self.ttl
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let held = self.held_for();
        if held > self.ttl {
            warn!(key = %self.key, held_ms = held.as_millis() as u64, ttl_ms = self.ttl.as_millis() as u64, "lock held past its ttl");
        }
        debug!(key = %self.key, held_ms = held.as_millis() as u64, "lock released");
    }
}

/// Hands out exclusive deployment locks.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait for the lock on `key`. Gives up when the service's acquire
    /// timeout runs out or `cancel` fires.
    async fn acquire(
        &self,
        key: &LockKey,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError>;
}

/// Process-local lock service backed by one `tokio::sync::Mutex` per key.
///
/// Waiters are served in arrival order. A key's slot is dropped once
/// nobody holds or waits on it.
pub struct InMemoryLockService {
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
    acquire_timeout: Duration,
}

impl InMemoryLockService {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Whether someone currently holds `key`.
    pub async fn is_locked(&self, key: &LockKey) -> bool {
        match self.locks.lock().await.get(key) {
            Some(slot) => slot.try_lock().is_err(),
            None => false,
        }
    }

    /// Number of keys with a live slot.
    pub async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn slot(&self, key: &LockKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Holders and waiters keep a clone; a lone map reference is idle.
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        locks.entry(key.clone()).or_default().clone()
    }
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(
        &self,
        key: &LockKey,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError> {
        let slot = self.slot(key).await;
        let started = Instant::now();

        tokio::select! {
            _ = cancel.cancelled() => Err(LockError::Cancelled(key.clone())),
            res = tokio::time::timeout(self.acquire_timeout, slot.lock_owned()) => match res {
                Ok(guard) => {
                    debug!(%key, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                    Ok(LockHandle::new(key.clone(), ttl, Box::new(guard)))
                }
                Err(_) => {
                    warn!(%key, "lock acquire timed out");
                    Err(LockError::Timeout {
                        key: key.clone(),
                        waited: started.elapsed(),
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(module: &str) -> LockKey {
        LockKey::new(Environment::Production, module)
    }

    #[test]
    fn key_display() {
        assert_eq!(key("payments").to_string(), "production/payments");
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquirer_waits_for_release() {
        let locks = Arc::new(InMemoryLockService::new(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let first = locks.acquire(&key("payments"), Duration::from_secs(60), &cancel).await.unwrap();
        assert!(locks.is_locked(&key("payments")).await);

        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                locks
                    .acquire(&key("payments"), Duration::from_secs(60), &cancel)
                    .await
                    .map(|h| h.key().clone())
            })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!waiter.is_finished());
        drop(first);

        assert_eq!(waiter.await.unwrap().unwrap(), key("payments"));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out() {
        let locks = InMemoryLockService::new(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let _held = locks.acquire(&key("payments"), Duration::from_secs(60), &cancel).await.unwrap();

        let err = locks
            .acquire(&key("payments"), Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { waited, .. } if waited == Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_honours_cancellation() {
        let locks = InMemoryLockService::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let _held = locks.acquire(&key("payments"), Duration::from_secs(60), &cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = locks
            .acquire(&key("payments"), Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LockError::Cancelled(key("payments")));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = InMemoryLockService::new(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let _a = locks.acquire(&key("payments"), Duration::from_secs(60), &cancel).await.unwrap();
        let _b = locks.acquire(&key("ledger"), Duration::from_secs(60), &cancel).await.unwrap();
        let _c = locks
            .acquire(&LockKey::new(Environment::Dev, "payments"), Duration::from_secs(60), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn released_keys_do_not_accumulate() {
        let locks = InMemoryLockService::new(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let held = locks.acquire(&key("payments"), Duration::from_secs(60), &cancel).await.unwrap();

        for i in 0..100 {
            let handle = locks
                .acquire(&key(&format!("module-{i}")), Duration::from_secs(60), &cancel)
                .await
                .unwrap();
            drop(handle);
        }

        // The held key plus the most recently released one.
        assert_eq!(locks.tracked_keys().await, 2);
        assert!(locks.is_locked(&key("payments")).await);

        drop(held);
        let _again = locks.acquire(&key("ledger"), Duration::from_secs(60), &cancel).await.unwrap();
        assert_eq!(locks.tracked_keys().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pruning_keeps_a_waiter_queued() {
        let locks = Arc::new(InMemoryLockService::new(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let first = locks.acquire(&key("payments"), Duration::from_secs(60), &cancel).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.acquire(&key("payments"), Duration::from_secs(60), &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(first);
        // Pruning runs while the waiter still holds its slot clone.
        let _other = locks.acquire(&key("ledger"), Duration::from_secs(60), &cancel).await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        let err = locks
            .acquire(&key("payments"), Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_reports_ttl_expiry() {
        let locks = InMemoryLockService::default();
        let handle = locks
            .acquire(&key("payments"), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!handle.is_expired());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_expired());
        drop(handle);
        assert!(!locks.is_locked(&key("payments")).await);
    }
}
