//! Moving failed connector instances back into a runnable or terminal state.

use std::collections::HashSet;

use opentelemetry::KeyValue;
use tracing::{debug, error, info};

use super::store::ConnectorInstanceStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{ConnectorInstance, ConnectorState, ContainerId};
use crate::telemetry::metrics;

/// Resets connector instances through a [`ConnectorInstanceStore`].
///
/// Runs inside the caller's transaction and takes no lock of its own. Batch
/// resets are best effort: when the store fails part way, instances already
/// reset stay reset and the error is returned.
pub struct ConnectorResetStrategy<S> {
    store: S,
    page_size: usize,
}

impl<S: ConnectorInstanceStore> ConnectorResetStrategy<S> {
    pub fn new(store: S, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(store: S, config: &Config) -> Self {
        Self::new(store, config.reset_page_size)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Move one instance to `target`, typically `SKIPPED` or `TO_RE_EXECUTE`.
    ///
    /// Leaving `FAILED` also clears the stored failure detail, if there is one.
    pub fn reset_state(&self, instance: &ConnectorInstance, target: ConnectorState) -> Result<()> {
        if !instance.state.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                id: instance.id,
                from: instance.state,
                to: target,
            });
        }

        if instance.state == ConnectorState::Failed {
            let detail = self.store.failure_detail(instance.id).map_err(|e| {
                error!(connector = %instance.id, error = %e, "failed to read failure detail");
                Error::StoreAccess(e)
            })?;
            if detail.is_some() {
                self.store
                    .set_failure_detail(instance.id, None)
                    .map_err(|e| {
                        error!(connector = %instance.id, error = %e, "failed to clear failure detail");
                        Error::StoreAccess(e)
                    })?;
            }
        }

        self.store.set_state(instance.id, target).map_err(|e| {
            error!(
                connector = %instance.id,
                from = %instance.state,
                to = %target,
                error = %e,
                "failed to reset connector state"
            );
            Error::StoreAccess(e)
        })?;

        metrics::connector_resets().add(1, &[KeyValue::new("to", target.to_string())]);
        debug!(connector = %instance.id, from = %instance.state, to = %target, "connector reset");
        Ok(())
    }

    /// Reset every `FAILED` connector of `container` to `TO_RE_EXECUTE`.
    /// Returns how many instances were reset.
    ///
    /// Pages are read by absolute offset. Rows reset by this pass stop
    /// occupying offsets in a store that reflects the writes, so the next
    /// offset only advances past rows of the page that are still failed.
    /// Rows seen in an earlier page are skipped, which also keeps the loop
    /// finite on stores whose listing does not see the writes yet.
    pub fn reset_all_failed_connectors_of(&self, container: ContainerId) -> Result<usize> {
        let mut offset = 0;
        let mut visited = HashSet::new();
        let mut reset = 0;

        loop {
            let page = self
                .store
                .list_by_state(container, ConnectorState::Failed, offset, self.page_size)
                .map_err(|e| {
                    error!(%container, offset, error = %e, "failed to list failed connectors");
                    Error::StoreAccess(e)
                })?;
            let fetched = page.len();

            let mut moved = 0;
            for instance in &page {
                if !visited.insert(instance.id) {
                    continue;
                }
                self.reset_state(instance, ConnectorState::ToReExecute)?;
                moved += 1;
            }
            reset += moved;

            if fetched < self.page_size {
                break;
            }
            offset += fetched - moved;
        }

        info!(%container, reset, "failed connectors reset for re-execution");
        Ok(reset)
    }
}
