//! Detection of abnormal asynchronous work.
//!
//! The dispatcher calls [`WorkExecutionAuditor::detect_and_notify`] on every
//! execution attempt. A work item that has been retried too often over too
//! long a period, or that has simply been around for too long, is reported to
//! the [`WorkExecutionListener`] once. If it later completes, the listener
//! hears about the recovery.
//!
//! Auditing never blocks or fails real work: a descriptor without a
//! registration date is logged and left alone.

use std::sync::Arc;

use chrono::Duration;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::WorkDescriptor;
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Abnormal-execution thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    /// Attempts at or above which long-lived work counts as looping.
    pub executions_threshold: u32,
    /// Minimum age before the attempt count is considered.
    pub executions_duration: Duration,
    /// Age at or above which work is abnormal regardless of attempts.
    pub elapsed_duration: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            executions_threshold: 10,
            executions_duration: Duration::hours(1),
            elapsed_duration: Duration::days(1),
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<()> {
        if self.executions_threshold == 0 {
            return Err(Error::Config(
                "audit executions threshold must be positive".to_string(),
            ));
        }
        if self.executions_duration <= Duration::zero() {
            return Err(Error::Config(
                "audit executions duration must be positive".to_string(),
            ));
        }
        if self.elapsed_duration < self.executions_duration {
            return Err(Error::Config(
                "audit elapsed duration must not be shorter than the executions duration"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Status and listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbnormalStatus {
    Ok,
    /// Retried at least `executions_threshold` times over `executions_duration`.
    TooManyExecutions,
    /// Still around after `elapsed_duration`.
    TooMuchTimeElapsed,
}

impl std::fmt::Display for AbnormalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbnormalStatus::Ok => "ok",
            AbnormalStatus::TooManyExecutions => "too_many_executions",
            AbnormalStatus::TooMuchTimeElapsed => "too_much_time_elapsed",
        };
        write!(f, "{s}")
    }
}

/// Sink for audit notifications. Fire-and-forget: implementations must not
/// block for long and cannot fail the work.
pub trait WorkExecutionListener: Send + Sync {
    fn on_abnormal_execution(&self, work: &WorkDescriptor, status: AbnormalStatus);

    fn on_recovered_execution(&self, work: &WorkDescriptor);
}

/// Default listener: structured logs plus the abnormal/recovered counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditListener;

impl WorkExecutionListener for TracingAuditListener {
    fn on_abnormal_execution(&self, work: &WorkDescriptor, status: AbnormalStatus) {
        warn!(
            work_id = %work.id,
            work_type = %work.work_type,
            executions = work.execution_count(),
            registered = ?work.registration_date,
            %status,
            "abnormal work execution detected"
        );
        metrics::abnormal_executions().add(
            1,
            &[
                KeyValue::new("work_type", work.work_type.clone()),
                KeyValue::new("status", status.to_string()),
            ],
        );
    }

    fn on_recovered_execution(&self, work: &WorkDescriptor) {
        info!(
            work_id = %work.id,
            work_type = %work.work_type,
            executions = work.execution_count(),
            "abnormal work eventually succeeded"
        );
        metrics::recovered_executions()
            .add(1, &[KeyValue::new("work_type", work.work_type.clone())]);
    }
}

// ---------------------------------------------------------------------------
// Auditor
// ---------------------------------------------------------------------------

pub struct WorkExecutionAuditor {
    clock: Arc<dyn Clock>,
    listener: Arc<dyn WorkExecutionListener>,
    config: AuditConfig,
}

impl WorkExecutionAuditor {
    pub fn new(
        clock: Arc<dyn Clock>,
        listener: Arc<dyn WorkExecutionListener>,
        config: AuditConfig,
    ) -> Self {
        Self {
            clock,
            listener,
            config,
        }
    }

    /// Wall clock and the tracing listener.
    pub fn with_defaults(config: AuditConfig) -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(TracingAuditListener), config)
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Classify `work` without notifying. `None` when it has no
    /// registration date.
    pub fn detect(&self, work: &WorkDescriptor) -> Option<AbnormalStatus> {
        let registered = work.registration_date?;
        let elapsed = (self.clock.now() - registered).max(Duration::zero());

        let status = if elapsed >= self.config.executions_duration
            && work.execution_count() >= self.config.executions_threshold
        {
            AbnormalStatus::TooManyExecutions
        } else if elapsed >= self.config.elapsed_duration {
            AbnormalStatus::TooMuchTimeElapsed
        } else {
            AbnormalStatus::Ok
        };
        Some(status)
    }

    /// Classify `work` and notify the listener the first time it is abnormal.
    pub fn detect_and_notify(&self, work: &WorkDescriptor) -> AbnormalStatus {
        let Some(status) = self.detect(work) else {
            error!(
                work_id = %work.id,
                work_type = %work.work_type,
                "work has no registration date, skipping abnormal execution detection"
            );
            return AbnormalStatus::Ok;
        };

        if status != AbnormalStatus::Ok && work.mark_abnormal_reported() {
            self.listener.on_abnormal_execution(work, status);
        }
        status
    }

    /// Report completion. Only work previously flagged abnormal reaches the
    /// listener.
    pub fn notify_success(&self, work: &WorkDescriptor) {
        if work.is_abnormal_reported() {
            self.listener.on_recovered_execution(work);
        }
    }
}
