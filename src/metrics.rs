use std::sync::Arc;
use tracing::{error, info};

use anyhow::Result;
use axum::{Router, routing::get};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, MeterProvider};
use opentelemetry_sdk::metrics::{MetricError, SdkMeterProvider};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;

pub struct Metrics {
    registry: Arc<prometheus::Registry>,
    _provider: SdkMeterProvider,
    pub network: String,

    // Init metrics
    pub contracts_watched: Gauge<u64>,
    pub filters_created: Counter<u64>,

    // Log metrics
    pub logs_converted: Counter<u64>,
    pub logs_skipped: Counter<u64>,
    pub logs_persisted: Counter<u64>,

    // Method metrics
    pub method_polls: Counter<u64>,

    // Cycle metrics
    pub cycles_completed: Counter<u64>,
    pub cycle_duration: Histogram<f64>,
    pub cursor_block: Gauge<u64>,
}

impl Metrics {
    pub fn new(network: String) -> Result<Self, MetricError> {
        // Create a new prometheus registry
        let registry = prometheus::Registry::new();

        // Configure OpenTelemetry to use this registry
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        // Set up a meter to create instruments
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("watcher_metrics");

        let contracts_watched = meter
            .u64_gauge("watcher_contracts_watched")
            .with_description("Number of contracts initialized for watching")
            .build();

        let filters_created = meter
            .u64_counter("watcher_filters_created")
            .with_description("Number of log filters registered")
            .build();

        let logs_converted = meter
            .u64_counter("watcher_logs_converted")
            .with_description("Number of watched logs decoded into records")
            .build();

        let logs_skipped = meter
            .u64_counter("watcher_logs_skipped")
            .with_description("Number of watched logs dropped by argument filters")
            .build();

        let logs_persisted = meter
            .u64_counter("watcher_logs_persisted")
            .with_description("Number of event records written to storage")
            .build();

        let method_polls = meter
            .u64_counter("watcher_method_polls")
            .with_description("Number of contract method polling passes")
            .build();

        let cycles_completed = meter
            .u64_counter("watcher_cycles_completed")
            .with_description("Number of execute cycles completed")
            .build();

        let cycle_duration = meter
            .f64_histogram("watcher_cycle_duration")
            .with_description("Time spent in one execute cycle")
            .with_boundaries(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
            .with_unit("s")
            .build();

        let cursor_block = meter
            .u64_gauge("watcher_cursor_block_number")
            .with_description("Last block the watcher has processed through")
            .build();

        Ok(Self {
            registry: Arc::new(registry),
            _provider: provider,
            network,
            contracts_watched,
            filters_created,
            logs_converted,
            logs_skipped,
            logs_persisted,
            method_polls,
            cycles_completed,
            cycle_duration,
            cursor_block,
        })
    }

    /// Current values in the Prometheus text format served on `/metrics`.
    pub fn export(&self) -> String {
        encode_registry(&self.registry)
    }

    pub fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("network", self.network.clone())]
    }

    pub async fn start_metrics_server(&self, addr: &str, port: u16) -> Result<()> {
        let addr = format!("{addr}:{port}").parse::<SocketAddr>()?;
        let registry = self.registry.clone();

        let app = Router::new().route("/metrics", get(move || metrics_handler(registry.clone())));

        // Determine the access URL based on the binding address. Only used for logging.
        let access_url = if addr.ip().to_string() == "0.0.0.0" {
            format!("http://localhost:{port}/metrics")
        } else {
            format!("http://{}:{port}/metrics", addr.ip())
        };

        info!(
            "Starting metrics server - binding to {} (accessible at {})",
            addr, access_url
        );

        let listener = tokio::net::TcpListener::bind(addr).await?;

        // Spawn the server in a separate task
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server stopped: {}", e);
            }
        });
        Ok(())
    }
}

async fn metrics_handler(registry: Arc<prometheus::Registry>) -> String {
    encode_registry(&registry)
}

fn encode_registry(registry: &prometheus::Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new("mainnet".to_string()).unwrap();
        metrics.cycles_completed.add(1, &metrics.labels());
        metrics.cursor_block.record(42, &metrics.labels());

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("watcher_cycles_completed")));
        assert!(names.iter().any(|n| n.starts_with("watcher_cursor_block_number")));
    }
}
