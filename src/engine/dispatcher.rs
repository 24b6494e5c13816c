//! Dispatcher: pulls work off the queue, audits every attempt, retries failures.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, error, info, warn};

use crate::audit::WorkExecutionAuditor;
use crate::error::{Error, Result};
use crate::model::WorkDescriptor;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// Configuration for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Maximum attempts running at once.
    pub max_concurrent: usize,
    /// Attempts before failing work is abandoned.
    pub max_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_attempts: 3,
        }
    }
}

/// Executes one unit of work. Errors make the dispatcher retry.
pub trait WorkHandler: Send + Sync + 'static {
    fn handle(&self, work: &WorkDescriptor) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    /// Failed with attempts left.
    Retry,
    /// Failed on its last allowed attempt.
    Abandoned,
}

/// The dispatch loop: receive work, run it through the auditor and handler.
pub struct WorkDispatcher<H> {
    handler: Arc<H>,
    auditor: Arc<WorkExecutionAuditor>,
    config: DispatchConfig,
    queue_tx: mpsc::UnboundedSender<Arc<WorkDescriptor>>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<Arc<WorkDescriptor>>>>,
    shutdown: Arc<Notify>,
    slots: Arc<Semaphore>,
}

impl<H> Clone for WorkDispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            auditor: Arc::clone(&self.auditor),
            config: self.config.clone(),
            queue_tx: self.queue_tx.clone(),
            queue_rx: Arc::clone(&self.queue_rx),
            shutdown: Arc::clone(&self.shutdown),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<H: WorkHandler> WorkDispatcher<H> {
    pub fn new(handler: Arc<H>, auditor: Arc<WorkExecutionAuditor>, config: DispatchConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            handler,
            auditor,
            config,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            shutdown: Arc::new(Notify::new()),
            slots,
        }
    }

    /// Queue work for execution.
    pub fn submit(&self, work: Arc<WorkDescriptor>) -> Result<()> {
        self.queue_tx
            .send(work)
            .map_err(|_| Error::Other("work queue closed".to_string()))
    }

    /// Signal the dispatch loop to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Attempts currently running.
    pub fn active(&self) -> usize {
        self.config.max_concurrent.max(1) - self.slots.available_permits()
    }

    /// Run the dispatch loop until shutdown.
    ///
    /// Shutdown waits for attempts already running. Work they requeue, and
    /// work never started, stays queued for the next `run`.
    pub async fn run(&self) -> Result<()> {
        let mut queue = self.queue_rx.lock().await;
        let mut running = JoinSet::new();
        info!(
            max_concurrent = self.config.max_concurrent,
            "dispatcher started"
        );

        loop {
            let work = tokio::select! {
                _ = self.shutdown.notified() => break,
                Some(joined) = running.join_next() => {
                    log_join_error(joined);
                    continue;
                }
                work = queue.recv() => match work {
                    Some(work) => work,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.shutdown.notified() => {
                    self.submit(work)?;
                    break;
                }
                permit = Arc::clone(&self.slots).acquire_owned() => permit
                    .map_err(|e| Error::Other(format!("dispatch slots closed: {e}")))?,
            };

            let this = self.clone();
            running.spawn(async move {
                let _permit = permit;
                if this.execute(&work).await == AttemptOutcome::Retry {
                    if let Err(e) = this.submit(Arc::clone(&work)) {
                        error!(work_id = %work.id, error = %e, "could not requeue work");
                    }
                }
            });
        }

        if !running.is_empty() {
            info!(in_flight = running.len(), "dispatcher draining running attempts");
        }
        while let Some(joined) = running.join_next().await {
            log_join_error(joined);
        }
        if !queue.is_empty() {
            warn!(queued = queue.len(), "dispatcher stopped with work still queued");
        }
        info!("dispatcher stopped");
        Ok(())
    }

    /// Run one attempt of `work`, audited. Does not requeue.
    pub async fn execute(&self, work: &WorkDescriptor) -> AttemptOutcome {
        let attempt = work.increment_execution_count();
        self.auditor.detect_and_notify(work);

        let work_span = start_work_span(&work.work_type, &work.id.0, attempt);
        async {
            record_state_transition(&work_span, "queued", "running");
            match self.handler.handle(work).await {
                Ok(()) => {
                    record_state_transition(&work_span, "running", "completed");
                    self.auditor.notify_success(work);
                    AttemptOutcome::Completed
                }
                Err(e) if attempt < self.config.max_attempts => {
                    record_state_transition(&work_span, "running", "queued");
                    warn!(work_id = %work.id, attempt, error = %e, "work failed, will retry");
                    AttemptOutcome::Retry
                }
                Err(e) => {
                    record_state_transition(&work_span, "running", "abandoned");
                    error!(
                        work_id = %work.id,
                        work_type = %work.work_type,
                        attempt,
                        error = %e,
                        "work abandoned"
                    );
                    AttemptOutcome::Abandoned
                }
            }
        }
        .instrument(work_span.clone())
        .await
    }
}

fn log_join_error(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "dispatch task failed");
    }
}
