//! Deadline-bounded connector execution.
//!
//! The connector runs on tokio's blocking pool while the caller waits with a
//! deadline. When the deadline passes the caller gets
//! [`Error::ConnectorTimeout`] and the connector's eventual result is thrown
//! away. The connector itself is not preempted: a stuck connector keeps its
//! blocking thread (and its concurrency slot) until it returns on its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};

use super::{Connector, ConnectorCallback, ConnectorValues};
use crate::clock::deadline_after;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::telemetry::{metrics, work::start_connector_span};

pub struct TimedConnectorExecutor {
    timeout_ms: AtomicU64,
    slots: Arc<Semaphore>,
}

impl TimedConnectorExecutor {
    pub fn new(timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            timeout_ms: AtomicU64::new(duration_ms(timeout)),
            slots: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.connector_timeout, config.max_concurrent_connectors)
    }

    /// Deadline applied to executions started from now on.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    /// Change the deadline for later executions. In-flight executions keep
    /// the deadline they started with.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(duration_ms(timeout), Ordering::Release);
    }

    /// Run `connector` with the current deadline.
    pub async fn execute<C: Connector>(
        &self,
        connector: C,
        inputs: ConnectorValues,
    ) -> Result<ConnectorValues> {
        let deadline = self.timeout();
        self.run(connector, inputs, deadline, None).await
    }

    /// Run `connector` with an explicit deadline for this invocation only.
    pub async fn execute_with_deadline<C: Connector>(
        &self,
        connector: C,
        inputs: ConnectorValues,
        deadline: Duration,
    ) -> Result<ConnectorValues> {
        self.run(connector, inputs, deadline, None).await
    }

    /// Run `connector` with the current deadline and report the outcome to
    /// `callback` as well as to the caller.
    pub async fn execute_and_notify<C: Connector>(
        &self,
        connector: C,
        inputs: ConnectorValues,
        callback: &dyn ConnectorCallback,
    ) -> Result<ConnectorValues> {
        let deadline = self.timeout();
        self.run(connector, inputs, deadline, Some(callback)).await
    }

    async fn run<C: Connector>(
        &self,
        connector: C,
        inputs: ConnectorValues,
        deadline: Duration,
        callback: Option<&dyn ConnectorCallback>,
    ) -> Result<ConnectorValues> {
        let name = connector.name().to_string();
        let span = start_connector_span(&name, duration_ms(deadline));
        let started = Instant::now();

        let result = self
            .run_until(connector, inputs, deadline_after(started, deadline), deadline)
            .instrument(span.clone())
            .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(Error::ConnectorTimeout { .. }) => "timeout",
            Err(_) => "error",
        };
        span.record("connector.result", outcome);
        metrics::connector_executions().add(
            1,
            &[
                KeyValue::new("connector", name.clone()),
                KeyValue::new("result", outcome),
            ],
        );
        metrics::connector_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("connector", name.clone())],
        );

        match &result {
            Ok(outputs) => {
                debug!(connector = %name, "connector completed");
                if let Some(callback) = callback {
                    callback.on_success(outputs);
                }
            }
            Err(e) => {
                warn!(connector = %name, error = %e, "connector failed");
                if let Some(callback) = callback {
                    callback.on_failure(e);
                }
            }
        }
        result
    }

    async fn run_until<C: Connector>(
        &self,
        connector: C,
        inputs: ConnectorValues,
        deadline_at: Instant,
        deadline: Duration,
    ) -> Result<ConnectorValues> {
        let name = connector.name().to_string();
        let timed_out = || Error::ConnectorTimeout {
            connector: name.clone(),
            deadline,
        };

        // Waiting for a free slot counts against the deadline.
        let permit =
            match tokio::time::timeout_at(deadline_at, Arc::clone(&self.slots).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(closed)) => return Err(Error::Other(format!("executor closed: {closed}"))),
                Err(_) => return Err(timed_out()),
            };

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_sequence(connector, &inputs)
        });

        match tokio::time::timeout_at(deadline_at, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::ConnectorExecution {
                connector: name.clone(),
                phase: "execute",
                source: anyhow::anyhow!("connector task aborted: {join}"),
            }),
            // The blocking task is detached; its result is dropped on arrival.
            Err(_) => Err(timed_out()),
        }
    }
}

fn run_sequence<C: Connector>(mut connector: C, inputs: &ConnectorValues) -> Result<ConnectorValues> {
    let name = connector.name().to_string();
    let failed = |phase: &'static str| {
        let connector = name.clone();
        move |source: anyhow::Error| Error::ConnectorExecution {
            connector,
            phase,
            source,
        }
    };

    connector.connect().map_err(failed("connect"))?;
    let executed = connector.execute(inputs).map_err(failed("execute"));
    let disconnected = connector.disconnect().map_err(failed("disconnect"));

    let outputs = executed?;
    disconnected?;
    Ok(outputs)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
