//! Core data model.
//!
//! Identifiers shared by every coordination service, the connector state
//! machine, and the descriptor carried by each unit of asynchronous work.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Tenant owning a lock, a process, or a correlation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub u64);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identity of one logical execution context (a worker task, a request).
///
/// Lock re-entrancy is keyed on this, not on the OS thread, because async
/// tasks move between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Newtype for work descriptor IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorInstanceId(pub i64);

impl std::fmt::Display for ConnectorInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connector#{}", self.0)
    }
}

/// The process or flow node instance a connector instance is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub i64);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "container#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Connector state
// ---------------------------------------------------------------------------

/// Lifecycle state of a connector invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    /// Scheduled with its flow node, not started.
    ToBeExecuted,
    /// Handed to the executor.
    Executing,
    /// Completed and outputs applied. Terminal.
    Done,
    /// Raised an error or timed out. Waits for an operator reset.
    Failed,
    /// Deliberately bypassed. Terminal.
    Skipped,
    /// Reset after a failure, will run again.
    ToReExecute,
    /// Owning process was aborted. Terminal.
    Aborted,
}

impl ConnectorState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ConnectorState) -> bool {
        use ConnectorState::*;
        if to == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (ToBeExecuted, Executing)
                | (ToBeExecuted, Skipped)
                | (Executing, Done)
                | (Executing, Failed)
                // stuck execution reset
                | (Executing, ToReExecute)
                | (Executing, Skipped)
                | (Failed, ToReExecute)
                | (Failed, Skipped)
                | (ToReExecute, Executing)
                | (ToReExecute, Skipped)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectorState::Done | ConnectorState::Skipped | ConnectorState::Aborted
        )
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectorState::ToBeExecuted => "TO_BE_EXECUTED",
            ConnectorState::Executing => "EXECUTING",
            ConnectorState::Done => "DONE",
            ConnectorState::Failed => "FAILED",
            ConnectorState::Skipped => "SKIPPED",
            ConnectorState::ToReExecute => "TO_RE_EXECUTE",
            ConnectorState::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Connector instance
// ---------------------------------------------------------------------------

/// A connector invocation as persisted by the connector store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInstance {
    pub id: ConnectorInstanceId,
    pub container_id: ContainerId,
    /// Connector definition name, e.g. "email-sender".
    pub name: String,
    pub state: ConnectorState,
}

/// Diagnostics captured when a connector fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    pub stack_trace: Option<String>,
}

impl FailureDetail {
    /// Capture an error and its source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            stack_trace: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Work descriptor
// ---------------------------------------------------------------------------

/// One unit of asynchronous, retryable work.
///
/// Shared between the dispatcher and the auditor; the two mutable fields are
/// atomics so concurrent attempts never observe a torn or decreasing value.
#[derive(Debug)]
pub struct WorkDescriptor {
    pub id: WorkId,
    /// What kind of work this is (e.g., "execute-flow-node", "deliver-message").
    pub work_type: String,
    /// Opaque to the coordination layer.
    pub payload: serde_json::Value,
    /// When the work was first scheduled. `None` is a scheduling bug.
    pub registration_date: Option<DateTime<Utc>>,
    execution_count: AtomicU32,
    abnormal_reported: AtomicBool,
}

impl WorkDescriptor {
    pub fn new(
        work_type: impl Into<String>,
        payload: serde_json::Value,
        registration_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WorkId::new(),
            work_type: work_type.into(),
            payload,
            registration_date: Some(registration_date),
            execution_count: AtomicU32::new(0),
            abnormal_reported: AtomicBool::new(false),
        }
    }

    /// A descriptor that lost its registration date, e.g. one rebuilt from
    /// an older serialized form.
    pub fn unregistered(work_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            registration_date: None,
            ..Self::new(work_type, payload, Utc::now())
        }
    }

    /// Number of execution attempts so far.
    pub fn execution_count(&self) -> u32 {
        self.execution_count.load(Ordering::Acquire)
    }

    /// Record a new execution attempt, returning the updated count.
    pub fn increment_execution_count(&self) -> u32 {
        self.execution_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_abnormal_reported(&self) -> bool {
        self.abnormal_reported.load(Ordering::Acquire)
    }

    /// Flip the abnormal flag. Returns `true` only for the call that flipped it.
    pub(crate) fn mark_abnormal_reported(&self) -> bool {
        self.abnormal_reported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
