//! Lock and connector instruments report with their own histogram buckets.

use std::time::Duration;

use flowcoord::connector::{Connector, ConnectorValues, TimedConnectorExecutor};
use flowcoord::lock::{EntityLockService, LockKey};
use flowcoord::model::{ContextId, TenantId};
use flowcoord::telemetry::metrics::{CONNECTOR_DURATION_BUCKETS_MS, LOCK_WAIT_BUCKETS_MS};
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

struct NoopConnector;

impl Connector for NoopConnector {
    fn name(&self) -> &str {
        "noop"
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&mut self, _inputs: &ConnectorValues) -> anyhow::Result<ConnectorValues> {
        Ok(ConnectorValues::new())
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn histogram_bounds(metrics: &[ResourceMetrics], name: &str) -> Vec<Vec<f64>> {
    metrics
        .iter()
        .flat_map(|rm| rm.scope_metrics())
        .flat_map(|sm| sm.metrics())
        .filter(|m| m.name() == name)
        .flat_map(|m| match m.data() {
            AggregatedMetrics::F64(MetricData::Histogram(h)) => {
                h.data_points().map(|dp| dp.bounds().collect()).collect::<Vec<_>>()
            }
            other => panic!("{name} is not an f64 histogram: {other:?}"),
        })
        .collect()
}

// The global meter provider is process-wide, so everything runs in one test.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_waits_and_connector_runs_use_domain_buckets() {
    let exporter = InMemoryMetricExporter::default();
    let provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter.clone()).build())
        .build();
    opentelemetry::global::set_meter_provider(provider.clone());

    let locks = EntityLockService::new(Duration::from_secs(1));
    let key = LockKey::new(TenantId(1), "process_instance", 1);
    let handle = locks.lock_with_default_timeout(key, ContextId::new()).await.unwrap();
    locks.unlock(handle).unwrap();

    TimedConnectorExecutor::new(Duration::from_secs(1), 1)
        .execute(NoopConnector, ConnectorValues::new())
        .await
        .unwrap();

    provider.force_flush().unwrap();
    let exported = exporter.get_finished_metrics().unwrap();

    let lock_bounds = histogram_bounds(&exported, "flowcoord.lock.wait_ms");
    assert!(!lock_bounds.is_empty());
    assert!(lock_bounds.iter().all(|b| b.as_slice() == LOCK_WAIT_BUCKETS_MS));

    let connector_bounds = histogram_bounds(&exported, "flowcoord.connector.duration_ms");
    assert!(!connector_bounds.is_empty());
    assert!(connector_bounds.iter().all(|b| b.as_slice() == CONNECTOR_DURATION_BUCKETS_MS));
}
