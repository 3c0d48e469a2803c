use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::engine::EngineError;
use crate::model::ProviderId;

type ProviderLock = Arc<Mutex<()>>;

/// Per-provider mutual exclusion. Providers never contend with each other.
///
/// Waiters queue FIFO on a tokio mutex. Once the lock is acquired the critical
/// section is spawned onto its own task together with the owned guard, so a
/// caller that stops polling cannot interrupt it half-way.
#[derive(Default)]
pub struct ConcurrencyGuard {
    locks: DashMap<ProviderId, ProviderLock>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, provider_id: &str) -> ProviderLock {
        if let Some(lock) = self.locks.get(provider_id) {
            return lock.value().clone();
        }
        self.locks
            .entry(provider_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Queue for `provider_id`'s lock with no bound on the wait.
    pub async fn lock_owned(&self, provider_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(provider_id).lock_owned().await
    }

    /// Run `critical` while holding `provider_id`'s lock.
    ///
    /// `wait` bounds only the time spent queueing for the lock; it never
    /// applies to `critical` itself.
    pub async fn with_provider_lock<F, T>(
        &self,
        provider_id: &str,
        wait: Option<Duration>,
        critical: F,
    ) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        let lock = self.lock_for(provider_id);
        let started = Instant::now();
        let guard = match wait {
            Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
                .await
                .map_err(|_| EngineError::LockTimeout)?,
            None => lock.lock_owned().await,
        };
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());

        let handle = tokio::spawn(async move {
            let _guard = guard;
            critical.await
        });
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(EngineError::Storage(format!("critical section aborted: {e}"))),
        }
    }

    /// Number of providers with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop lock entries that nobody holds or waits on.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        // Only the map holds a reference to an idle lock.
        self.locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - self.locks.len()
    }
}
