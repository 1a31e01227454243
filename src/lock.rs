//! Named cooperative async mutex with owner diagnostics.
//!
//! FIFO waiters (tokio semaphore fairness), a per-acquisition timeout
//! (0 = wait forever) that surfaces the current holder's description in the
//! timeout error, RAII release on every exit path, and a `wait_for_unlock`
//! observer for readers that only need the lock to be free, not to hold it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// A cooperative mutex with queued waiters and an owner description.
#[derive(Clone)]
pub struct CoopMutex {
    name: String,
    semaphore: Arc<Semaphore>,
    owner: Arc<parking_lot::Mutex<Option<String>>>,
    released: Arc<Notify>,
    default_timeout_ms: u64,
}

/// Guard holding the lock; releasing happens on drop, on all exit paths.
#[derive(Debug)]
pub struct CoopGuard {
    name: String,
    owner: Arc<parking_lot::Mutex<Option<String>>>,
    released: Arc<Notify>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for CoopGuard {
    fn drop(&mut self) {
        // Clear the owner before the permit releases (fields drop after
        // this body), so the next holder never sees a stale description.
        *self.owner.lock() = None;
        self.released.notify_waiters();
        debug!(lock = %self.name, "released");
    }
}

impl CoopMutex {
    /// Create a named lock. `default_timeout_ms` of 0 means wait forever.
    pub fn new(name: &str, default_timeout_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            semaphore: Arc::new(Semaphore::new(1)),
            owner: Arc::new(parking_lot::Mutex::new(None)),
            released: Arc::new(Notify::new()),
            default_timeout_ms,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description of the current holder, if any.
    pub fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Acquire with the lock's default timeout.
    pub async fn acquire(&self, owner_desc: &str) -> Result<CoopGuard> {
        self.acquire_timeout(owner_desc, self.default_timeout_ms).await
    }

    /// Acquire with an explicit timeout in milliseconds (0 = wait forever).
    pub async fn acquire_timeout(&self, owner_desc: &str, timeout_ms: u64) -> Result<CoopGuard> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = if timeout_ms == 0 {
            acquire
                .await
                .map_err(|_| Error::store_fatal("lock semaphore closed"))?
        } else {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), acquire).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::store_fatal("lock semaphore closed")),
                Err(_) => {
                    return Err(Error::LockTimeout {
                        name: self.name.clone(),
                        owner: self.owner().unwrap_or_else(|| "unknown".into()),
                    })
                }
            }
        };
        *self.owner.lock() = Some(owner_desc.to_string());
        debug!(lock = %self.name, owner = owner_desc, "acquired");
        Ok(CoopGuard {
            name: self.name.clone(),
            owner: Arc::clone(&self.owner),
            released: Arc::clone(&self.released),
            _permit: permit,
        })
    }

    /// Wait until the lock is observed free (without acquiring it).
    /// Returns `false` on expiry; `timeout_ms` of 0 waits forever.
    pub async fn wait_for_unlock(&self, timeout_ms: u64) -> bool {
        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_locked() {
                return true;
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let lock = CoopMutex::new("ingestion", 0);
        {
            let _guard = lock.acquire("test").await.unwrap();
            assert!(lock.is_locked());
            assert_eq!(lock.owner().as_deref(), Some("test"));
        }
        assert!(!lock.is_locked());
        assert_eq!(lock.owner(), None);
    }

    #[tokio::test]
    async fn timeout_reports_holder() {
        let lock = CoopMutex::new("ingestion", 0);
        let _guard = lock.acquire("initial sync").await.unwrap();

        let err = lock.acquire_timeout("waiter", 20).await.unwrap_err();
        match err {
            Error::LockTimeout { name, owner } => {
                assert_eq!(name, "ingestion");
                assert_eq!(owner, "initial sync");
            }
            other => panic!("expected LockTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn waiters_run_in_fifo_order() {
        let lock = Arc::new(CoopMutex::new("ingestion", 0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let guard = lock.acquire("holder").await.unwrap();
        let mut tasks = Vec::new();
        for i in 0..3 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _guard = lock.acquire(&format!("waiter-{i}")).await.unwrap();
                order.lock().push(i);
            }));
            // Let each waiter enqueue before the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(guard);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn guard_releases_on_panic_path() {
        let lock = Arc::new(CoopMutex::new("embedding", 0));
        let cloned = Arc::clone(&lock);
        let task = tokio::spawn(async move {
            let _guard = cloned.acquire("doomed").await.unwrap();
            panic!("boom");
        });
        assert!(task.await.is_err());
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn wait_for_unlock_observes_release() {
        let lock = Arc::new(CoopMutex::new("ingestion", 0));
        let guard = lock.acquire("holder").await.unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.wait_for_unlock(1_000).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_unlock_expires() {
        let lock = CoopMutex::new("ingestion", 0);
        let _guard = lock.acquire("holder").await.unwrap();
        assert!(!lock.wait_for_unlock(30).await);
    }

    #[tokio::test]
    async fn wait_for_unlock_immediate_when_free() {
        let lock = CoopMutex::new("ingestion", 0);
        assert!(lock.wait_for_unlock(10).await);
    }
}
