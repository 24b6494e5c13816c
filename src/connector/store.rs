//! Persistence seam for connector instances.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use tracing::error;

use crate::error::{Error, Result};
use crate::model::{
    ConnectorInstance, ConnectorInstanceId, ConnectorState, ContainerId, FailureDetail,
};

/// Connector instance store contract.
///
/// Every call runs inside a transaction the caller opened; implementations
/// do not begin or commit on their own.
/// - `list_by_state` pages by absolute offset in a stable order (by id).
///   Whether rows written earlier in the same transaction still show up is
///   implementation-defined; callers must cope with both.
pub trait ConnectorInstanceStore: Send + Sync {
    fn get(&self, id: ConnectorInstanceId) -> anyhow::Result<Option<ConnectorInstance>>;

    fn list_by_state(
        &self,
        container: ContainerId,
        state: ConnectorState,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<ConnectorInstance>>;

    fn set_state(&self, id: ConnectorInstanceId, state: ConnectorState) -> anyhow::Result<()>;

    fn failure_detail(&self, id: ConnectorInstanceId) -> anyhow::Result<Option<FailureDetail>>;

    fn set_failure_detail(
        &self,
        id: ConnectorInstanceId,
        detail: Option<FailureDetail>,
    ) -> anyhow::Result<()>;
}

macro_rules! forward_store {
    ($($ptr:ty),*) => {$(
        impl<S: ConnectorInstanceStore + ?Sized> ConnectorInstanceStore for $ptr {
            fn get(&self, id: ConnectorInstanceId) -> anyhow::Result<Option<ConnectorInstance>> {
                (**self).get(id)
            }

            fn list_by_state(
                &self,
                container: ContainerId,
                state: ConnectorState,
                offset: usize,
                limit: usize,
            ) -> anyhow::Result<Vec<ConnectorInstance>> {
                (**self).list_by_state(container, state, offset, limit)
            }

            fn set_state(&self, id: ConnectorInstanceId, state: ConnectorState) -> anyhow::Result<()> {
                (**self).set_state(id, state)
            }

            fn failure_detail(
                &self,
                id: ConnectorInstanceId,
            ) -> anyhow::Result<Option<FailureDetail>> {
                (**self).failure_detail(id)
            }

            fn set_failure_detail(
                &self,
                id: ConnectorInstanceId,
                detail: Option<FailureDetail>,
            ) -> anyhow::Result<()> {
                (**self).set_failure_detail(id, detail)
            }
        }
    )*};
}

forward_store!(&S, std::sync::Arc<S>);

/// Mark an executing connector instance `FAILED` and keep the error for
/// diagnostics. Used by the process layer after a connector timeout or error.
pub fn record_failure<S: ConnectorInstanceStore + ?Sized>(
    store: &S,
    id: ConnectorInstanceId,
    cause: &Error,
) -> Result<()> {
    let instance = store
        .get(id)
        .map_err(Error::StoreAccess)?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    if !instance.state.can_transition_to(ConnectorState::Failed) {
        return Err(Error::InvalidTransition {
            id,
            from: instance.state,
            to: ConnectorState::Failed,
        });
    }
    let write = || -> anyhow::Result<()> {
        store.set_failure_detail(id, Some(FailureDetail::from_error(cause)))?;
        store.set_state(id, ConnectorState::Failed)
    };
    write().map_err(|e| {
        error!(connector = %id, error = %e, "failed to record connector failure");
        Error::StoreAccess(e)
    })
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Record {
    instance: ConnectorInstance,
    failure: Option<FailureDetail>,
}

/// In-process store; writes are visible to the next read immediately.
#[derive(Debug, Default)]
pub struct MemoryConnectorStore {
    records: Mutex<BTreeMap<ConnectorInstanceId, Record>>,
    detail_writes: Mutex<u64>,
}

impl MemoryConnectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance: ConnectorInstance, failure: Option<FailureDetail>) {
        self.records()
            .insert(instance.id, Record { instance, failure });
    }

    /// Number of failure-detail writes performed, for asserting that clearing
    /// an absent detail is skipped.
    pub fn failure_detail_writes(&self) -> u64 {
        *self.detail_writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<ConnectorInstanceId, Record>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConnectorInstanceStore for MemoryConnectorStore {
    fn get(&self, id: ConnectorInstanceId) -> anyhow::Result<Option<ConnectorInstance>> {
        Ok(self.records().get(&id).map(|r| r.instance.clone()))
    }

    fn list_by_state(
        &self,
        container: ContainerId,
        state: ConnectorState,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<ConnectorInstance>> {
        Ok(self
            .records()
            .values()
            .filter(|r| r.instance.container_id == container && r.instance.state == state)
            .skip(offset)
            .take(limit)
            .map(|r| r.instance.clone())
            .collect())
    }

    fn set_state(&self, id: ConnectorInstanceId, state: ConnectorState) -> anyhow::Result<()> {
        let mut records = self.records();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no connector instance {id}"))?;
        record.instance.state = state;
        Ok(())
    }

    fn failure_detail(&self, id: ConnectorInstanceId) -> anyhow::Result<Option<FailureDetail>> {
        Ok(self.records().get(&id).and_then(|r| r.failure.clone()))
    }

    fn set_failure_detail(
        &self,
        id: ConnectorInstanceId,
        detail: Option<FailureDetail>,
    ) -> anyhow::Result<()> {
        let mut records = self.records();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no connector instance {id}"))?;
        record.failure = detail;
        *self.detail_writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
