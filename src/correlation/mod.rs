//! Message event correlation.
//!
//! Pairs waiting catch events with thrown events. A throw is handed straight
//! to the oldest matching waiter if there is one, otherwise it is kept until a
//! waiter asks for it; a waiter takes the oldest matching pending throw or
//! waits for one. Matching is first-registered-first-matched on both sides,
//! and a matched pair leaves both pending sets under the same critical section
//! so nothing is delivered twice.

pub mod key;

pub use key::CorrelationKey;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::model::TenantId;
use crate::telemetry::metrics;

/// Identifies what a throw delivers, e.g. a message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadId(pub i64);

impl std::fmt::Display for PayloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "payload#{}", self.0)
    }
}

/// What [`MessageCorrelationEngine::register_throw`] did with a throw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrowOutcome {
    /// Delivered to a waiting catch event.
    HandedOff,
    /// No waiter matched; kept for a later `await_match`.
    Stored,
}

#[derive(Debug)]
struct PendingThrow {
    seq: u64,
    key: CorrelationKey,
    payload: PayloadId,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    key: CorrelationKey,
    tx: oneshot::Sender<PendingThrow>,
}

#[derive(Debug, Default)]
struct Pending {
    next_seq: u64,
    /// Ordered by `seq`.
    throws: VecDeque<PendingThrow>,
    /// Ordered by registration.
    waiters: VecDeque<Waiter>,
}

impl Pending {
    /// Hand `throw` to the oldest live matching waiter, or keep it in `seq`
    /// order.
    fn offer(&mut self, mut throw: PendingThrow) -> ThrowOutcome {
        while let Some(pos) = self
            .waiters
            .iter()
            .position(|w| w.key.is_subset_of(&throw.key))
        {
            let Some(waiter) = self.waiters.remove(pos) else {
                break;
            };
            match waiter.tx.send(throw) {
                Ok(()) => return ThrowOutcome::HandedOff,
                // Receiver already gone; try the next waiter.
                Err(returned) => throw = returned,
            }
        }
        let pos = self.throws.partition_point(|t| t.seq < throw.seq);
        self.throws.insert(pos, throw);
        ThrowOutcome::Stored
    }

    fn take_throw(&mut self, partial: &CorrelationKey) -> Option<PendingThrow> {
        let pos = self.throws.iter().position(|t| partial.is_subset_of(&t.key))?;
        self.throws.remove(pos)
    }
}

/// Correlation engine for one tenant.
#[derive(Debug, Default)]
pub struct MessageCorrelationEngine {
    pending: Mutex<Pending>,
}

impl MessageCorrelationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a thrown event to the oldest matching waiter, or keep it.
    pub fn register_throw(&self, full_key: CorrelationKey, payload: PayloadId) -> ThrowOutcome {
        let outcome = {
            let mut pending = self.pending();
            let seq = pending.next_seq;
            pending.next_seq += 1;
            pending.offer(PendingThrow {
                seq,
                key: full_key,
                payload,
            })
        };
        let label = match outcome {
            ThrowOutcome::HandedOff => "handed_off",
            ThrowOutcome::Stored => "stored",
        };
        metrics::correlations().add(1, &[KeyValue::new("outcome", label)]);
        debug!(%payload, outcome = label, "throw registered");
        outcome
    }

    /// Take the oldest pending throw matching `partial_key`, without waiting.
    pub fn try_match(&self, partial_key: &CorrelationKey) -> Option<PayloadId> {
        let throw = self.pending().take_throw(partial_key)?;
        metrics::correlations().add(1, &[KeyValue::new("outcome", "matched_pending")]);
        Some(throw.payload)
    }

    /// Wait up to `timeout` for a throw matching `partial_key`.
    ///
    /// Returns [`Error::CorrelationTimeout`] if none arrives; the waiter is
    /// gone from the engine by then. Dropping the future also withdraws it.
    pub async fn await_match(
        &self,
        partial_key: CorrelationKey,
        timeout: Duration,
    ) -> Result<PayloadId> {
        let (id, rx) = {
            let mut pending = self.pending();
            if let Some(throw) = pending.take_throw(&partial_key) {
                drop(pending);
                metrics::correlations().add(1, &[KeyValue::new("outcome", "matched_pending")]);
                return Ok(throw.payload);
            }
            let id = pending.next_seq;
            pending.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            pending.waiters.push_back(Waiter {
                id,
                key: partial_key,
                tx,
            });
            (id, rx)
        };

        let mut waiting = WaiterGuard {
            engine: self,
            id,
            rx,
            armed: true,
        };

        match tokio::time::timeout(timeout, &mut waiting.rx).await {
            Ok(Ok(throw)) => {
                waiting.armed = false;
                Ok(throw.payload)
            }
            Ok(Err(_)) => {
                // Senders are only dropped after a failed send, which needs
                // our receiver to be gone already.
                waiting.armed = false;
                error!(waiter = id, "correlation waiter lost its sender");
                Err(Error::Other("correlation waiter lost its sender".to_string()))
            }
            Err(_) => {
                waiting.armed = false;
                match waiting.withdraw() {
                    Some(throw) => {
                        debug!(waiter = id, payload = %throw.payload, "matched at the deadline");
                        Ok(throw.payload)
                    }
                    None => {
                        metrics::correlations().add(1, &[KeyValue::new("outcome", "timeout")]);
                        Err(Error::CorrelationTimeout { timeout })
                    }
                }
            }
        }
    }

    pub fn pending_throws(&self) -> usize {
        self.pending().throws.len()
    }

    pub fn pending_waiters(&self) -> usize {
        self.pending().waiters.len()
    }
}

/// Withdraws an abandoned waiter, putting back any throw that reached it.
struct WaiterGuard<'a> {
    engine: &'a MessageCorrelationEngine,
    id: u64,
    rx: oneshot::Receiver<PendingThrow>,
    armed: bool,
}

impl WaiterGuard<'_> {
    /// Leave the waiter set. Returns the throw if one was handed off first.
    fn withdraw(&mut self) -> Option<PendingThrow> {
        let mut pending = self.engine.pending();
        if let Some(pos) = pending.waiters.iter().position(|w| w.id == self.id) {
            pending.waiters.remove(pos);
            return None;
        }
        // Hand-off happens under the same lock, so the value is already here.
        self.rx.try_recv().ok()
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(throw) = self.withdraw() {
            debug!(waiter = self.id, payload = %throw.payload, "waiter cancelled, re-offering throw");
            self.engine.pending().offer(throw);
        }
    }
}

/// One correlation engine per tenant, created on first use.
#[derive(Debug, Default)]
pub struct CorrelationEngines {
    engines: Mutex<HashMap<TenantId, Arc<MessageCorrelationEngine>>>,
}

impl CorrelationEngines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(&self, tenant: TenantId) -> Arc<MessageCorrelationEngine> {
        let mut engines = self.engines.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(engines.entry(tenant).or_default())
    }
}
