//! Connectors: pluggable units of external logic run during process execution.
//!
//! [`TimedConnectorExecutor`] runs a connector under a wall-clock deadline,
//! [`ConnectorResetStrategy`] moves failed connector instances back into a
//! replayable or terminal state, and [`ConnectorInstanceStore`] is the
//! persistence seam both rely on.

pub mod executor;
pub mod reset;
pub mod store;

pub use executor::TimedConnectorExecutor;
pub use reset::ConnectorResetStrategy;
pub use store::{ConnectorInstanceStore, MemoryConnectorStore, record_failure};

use crate::error::Error;

/// Named input or output parameters of a connector.
pub type ConnectorValues = serde_json::Map<String, serde_json::Value>;

/// External logic invoked by the engine.
///
/// Implementations are blocking: the executor runs them on the blocking pool.
/// `disconnect` runs whenever `connect` succeeded, even if `execute` failed.
pub trait Connector: Send + 'static {
    /// Definition name used in logs and metrics.
    fn name(&self) -> &str;

    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&mut self, inputs: &ConnectorValues) -> anyhow::Result<ConnectorValues>;

    fn disconnect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Receives the outcome of one connector execution, exactly once.
pub trait ConnectorCallback: Send + Sync {
    fn on_success(&self, outputs: &ConnectorValues);

    /// Called for timeouts as well as connector errors.
    fn on_failure(&self, error: &Error);
}
