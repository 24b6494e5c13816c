//! Error types for flowcoord.

use std::time::Duration;

use thiserror::Error;

use crate::model::{ConnectorInstanceId, ConnectorState};

#[derive(Debug, Error)]
pub enum Error {
    /// The lock was still contended when the deadline passed.
    #[error("lock on {key} not acquired within {timeout:?}")]
    LockTimeout { key: String, timeout: Duration },

    /// The lock primitive itself failed. No hold is left behind.
    #[error("lock failure on {key}: {reason}")]
    Lock { key: String, reason: String },

    #[error("connector {connector} did not complete within {deadline:?}")]
    ConnectorTimeout {
        connector: String,
        deadline: Duration,
    },

    #[error("connector {connector} failed during {phase}: {source}")]
    ConnectorExecution {
        connector: String,
        phase: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("no correlation match within {timeout:?}")]
    CorrelationTimeout { timeout: Duration },

    #[error("connector store access failed: {0}")]
    StoreAccess(#[source] anyhow::Error),

    #[error("invalid connector state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ConnectorInstanceId,
        from: ConnectorState,
        to: ConnectorState,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Timeouts of any blocking operation.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::ConnectorTimeout { .. }
                | Error::CorrelationTimeout { .. }
        )
    }

    /// Conditions the immediate caller is expected to retry or route,
    /// as opposed to failures that mean something is broken.
    pub fn is_recoverable(&self) -> bool {
        self.is_timeout()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
