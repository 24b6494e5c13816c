//! Advisory per-entity locking.
//!
//! Locks are keyed by `(tenant, entity type, entity id)` and are created on
//! first use and removed from the registry as soon as nobody holds or waits
//! for them, so the registry does not grow with the number of distinct
//! entities ever touched.
//!
//! Acquisition fetches (or creates) the lock object inside one short registry
//! critical section, then waits for it outside that section. After the wait it
//! re-checks that the object it won is still the one registered for the key;
//! if an unlock removed it in between, the stale object is released and the
//! whole acquisition retries against the current registry entry.
//!
//! Holds are re-entrant per [`ContextId`]: a context that already holds a key
//! gets another handle immediately, and the lock is released once every handle
//! has been passed to [`EntityLockService::unlock`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::clock::deadline_after;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{ContextId, TenantId};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Key and handle
// ---------------------------------------------------------------------------

/// Identifies one advisory lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub tenant: TenantId,
    /// Entity type tag, e.g. "process_instance" or "flow_node".
    pub entity_type: String,
    pub entity_id: i64,
}

impl LockKey {
    pub fn new(tenant: TenantId, entity_type: impl Into<String>, entity_id: i64) -> Self {
        Self {
            tenant,
            entity_type: entity_type.into(),
            entity_id,
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.entity_type, self.entity_id)
    }
}

/// Proof of one hold on a lock. Give it back with [`EntityLockService::unlock`].
#[must_use = "a dropped handle keeps the entity locked"]
#[derive(Debug)]
pub struct LockHandle {
    key: LockKey,
    context: ContextId,
    lock: Arc<EntityLock>,
}

impl LockHandle {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn context(&self) -> ContextId {
        self.context
    }
}

// ---------------------------------------------------------------------------
// Lock objects
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct EntityLock {
    /// Single permit: whoever owns it owns the entity.
    permit: Arc<Semaphore>,
    holder: Mutex<Option<Holder>>,
}

#[derive(Debug)]
struct Holder {
    context: ContextId,
    holds: u32,
    _permit: OwnedSemaphorePermit,
}

impl EntityLock {
    fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            holder: Mutex::new(None),
        }
    }

    fn holder(&self) -> MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a hold if `context` already owns the lock.
    fn reenter(&self, context: ContextId) -> Option<u32> {
        let mut holder = self.holder();
        match holder.as_mut() {
            Some(h) if h.context == context => {
                h.holds += 1;
                Some(h.holds)
            }
            _ => None,
        }
    }
}

/// Registry slot. `interest` counts contexts that are waiting for or holding
/// the lock; the slot is removed when it drops to zero.
#[derive(Debug)]
struct Slot {
    lock: Arc<EntityLock>,
    interest: usize,
}

/// Releases a registered interest unless the acquisition completed.
struct InterestGuard<'a> {
    service: &'a EntityLockService,
    key: &'a LockKey,
    lock: Option<Arc<EntityLock>>,
}

impl InterestGuard<'_> {
    fn keep(mut self) {
        self.lock = None;
    }
}

impl Drop for InterestGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            self.service.release_interest(self.key, &lock);
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// In-process advisory lock service. Construct one per process and share it.
#[derive(Debug)]
pub struct EntityLockService {
    registry: Mutex<HashMap<LockKey, Slot>>,
    default_timeout: Duration,
}

impl EntityLockService {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.lock_timeout)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<LockKey, Slot>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `timeout` for the lock on `key`.
    ///
    /// Returns [`Error::LockTimeout`] when the lock stays contended, and
    /// [`Error::Lock`] if the primitive fails. Neither leaves a hold or a
    /// registry entry behind, and neither does dropping the returned future.
    pub async fn lock(
        &self,
        key: LockKey,
        context: ContextId,
        timeout: Duration,
    ) -> Result<LockHandle> {
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);

        loop {
            let lock = match self.register_interest(&key, context) {
                Registered::Reentered(handle) => return Ok(handle),
                Registered::Waiting(lock) => lock,
            };
            let interest = InterestGuard {
                service: self,
                key: &key,
                lock: Some(Arc::clone(&lock)),
            };

            let permit =
                match tokio::time::timeout_at(deadline, Arc::clone(&lock.permit).acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(closed)) => {
                        drop(interest);
                        error!(%key, %context, error = %closed, "lock primitive closed");
                        record_acquisition("error", started);
                        return Err(Error::Lock {
                            key: key.to_string(),
                            reason: closed.to_string(),
                        });
                    }
                    Err(_) => {
                        drop(interest);
                        debug!(%key, %context, ?timeout, "lock wait timed out");
                        record_acquisition("timeout", started);
                        return Err(Error::LockTimeout {
                            key: key.to_string(),
                            timeout,
                        });
                    }
                };

            if !self.is_registered(&key, &lock) {
                // Removed while we were waiting: this object no longer guards
                // the key. Let it go and start over.
                warn!(%key, %context, "acquired a stale lock object, retrying");
                drop(permit);
                drop(interest);
                continue;
            }

            *lock.holder() = Some(Holder {
                context,
                holds: 1,
                _permit: permit,
            });
            interest.keep();
            record_acquisition("acquired", started);
            return Ok(LockHandle { key, context, lock });
        }
    }

    /// [`lock`](Self::lock) with the configured default timeout.
    pub async fn lock_with_default_timeout(
        &self,
        key: LockKey,
        context: ContextId,
    ) -> Result<LockHandle> {
        self.lock(key, context, self.default_timeout).await
    }

    /// Take the lock only if it is free (or already held by `context`).
    pub fn try_lock(&self, key: LockKey, context: ContextId) -> Option<LockHandle> {
        let started = Instant::now();
        let lock = match self.register_interest(&key, context) {
            Registered::Reentered(handle) => return Some(handle),
            Registered::Waiting(lock) => lock,
        };
        let interest = InterestGuard {
            service: self,
            key: &key,
            lock: Some(Arc::clone(&lock)),
        };
        let permit = Arc::clone(&lock.permit).try_acquire_owned().ok()?;
        *lock.holder() = Some(Holder {
            context,
            holds: 1,
            _permit: permit,
        });
        interest.keep();
        record_acquisition("acquired", started);
        Some(LockHandle { key, context, lock })
    }

    /// Release one hold. The last release frees the lock for the next waiter,
    /// or drops the registry entry if nobody is waiting.
    pub fn unlock(&self, handle: LockHandle) -> Result<()> {
        let LockHandle { key, context, lock } = handle;

        let released = {
            let mut holder = lock.holder();
            match holder.as_mut() {
                Some(h) if h.context == context => {
                    h.holds -= 1;
                    if h.holds == 0 {
                        // Dropping the holder returns the permit.
                        *holder = None;
                        true
                    } else {
                        false
                    }
                }
                other => {
                    let owner = other.as_ref().map(|h| h.context.to_string());
                    error!(%key, %context, ?owner, "unlock by a context that does not hold the lock");
                    return Err(Error::Lock {
                        key: key.to_string(),
                        reason: format!("not held by context {context}"),
                    });
                }
            }
        };

        if released {
            self.release_interest(&key, &lock);
            debug!(%key, %context, "lock released");
        }
        Ok(())
    }

    /// Is the lock for `key` currently held by anyone?
    pub fn is_locked(&self, key: &LockKey) -> bool {
        let lock = match self.registry().get(key) {
            Some(slot) => Arc::clone(&slot.lock),
            None => return false,
        };
        lock.holder().is_some()
    }

    /// Number of live lock objects. Zero when nothing is held or awaited.
    pub fn registered_locks(&self) -> usize {
        self.registry().len()
    }

    fn register_interest(&self, key: &LockKey, context: ContextId) -> Registered {
        let mut registry = self.registry();
        let slot = registry.entry(key.clone()).or_insert_with(|| Slot {
            lock: Arc::new(EntityLock::new()),
            interest: 0,
        });
        if let Some(holds) = slot.lock.reenter(context) {
            debug!(%key, %context, holds, "lock re-entered");
            metrics::lock_acquisitions().add(1, &[KeyValue::new("result", "reentered")]);
            return Registered::Reentered(LockHandle {
                key: key.clone(),
                context,
                lock: Arc::clone(&slot.lock),
            });
        }
        slot.interest += 1;
        Registered::Waiting(Arc::clone(&slot.lock))
    }

    fn is_registered(&self, key: &LockKey, lock: &Arc<EntityLock>) -> bool {
        self.registry()
            .get(key)
            .is_some_and(|slot| Arc::ptr_eq(&slot.lock, lock))
    }

    fn release_interest(&self, key: &LockKey, lock: &Arc<EntityLock>) {
        let mut registry = self.registry();
        let Some(slot) = registry.get_mut(key) else {
            return;
        };
        if !Arc::ptr_eq(&slot.lock, lock) {
            return;
        }
        slot.interest = slot.interest.saturating_sub(1);
        if slot.interest == 0 {
            registry.remove(key);
        }
    }
}

enum Registered {
    Reentered(LockHandle),
    Waiting(Arc<EntityLock>),
}

fn record_acquisition(result: &'static str, started: Instant) {
    metrics::lock_acquisitions().add(1, &[KeyValue::new("result", result)]);
    metrics::lock_wait_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("result", result)],
    );
}
