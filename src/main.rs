use std::sync::Arc;
use std::time::Duration;

use alloy_provider::ProviderBuilder;
use anyhow::{Result, anyhow};
use tokio::{signal, time::sleep};
use tracing::{error, info, warn};
use tracing_subscriber::{self, EnvFilter};
use url::Url;

use contract_watcher::metrics::Metrics;
use contract_watcher::storage::bigquery::BigQueryStore;
use contract_watcher::transformer::Transformer;
use contract_watcher::utils::load_config;

const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!();
    info!("=========================== INITIALIZING ===========================");

    // Load config
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = match load_config(&config_path) {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {:#}", e);
            return Err(anyhow!(e));
        }
    };

    // Initialize optional metrics
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new(config.network.clone())?);
        metrics
            .start_metrics_server(&config.metrics.address, config.metrics.port)
            .await?;
        Some(metrics)
    } else {
        info!("Metrics are disabled");
        None
    };

    // Create dataset and tables. Handles existing datasets and tables.
    let store = BigQueryStore::connect(
        &config.dataset,
        &config.source_dataset,
        &config.dataset_location,
    )
    .await?;
    store.initialize().await?;

    // Create RPC provider
    let rpc_url: Url = config.rpc_url.parse()?;
    info!("RPC URL: {}", rpc_url);
    let provider = ProviderBuilder::new().connect_http(rpc_url);

    let mut transformer = Transformer::new(
        config.contract_config(),
        provider,
        store,
        &config.abi_lookup,
        config.max_blocks_per_cycle,
    );
    if let Some(metrics) = metrics {
        transformer = transformer.with_metrics(metrics);
    }

    transformer.init().await?;

    println!();
    info!("========================= STARTING WATCHER =========================");

    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    loop {
        match transformer.execute().await {
            Ok(()) => info!("Cycle complete, cursor at block {:?}", transformer.last_block()),
            Err(e) if e.is_retryable() => {
                warn!("Cycle failed, retrying in {:?}: {:#}", poll_interval, anyhow!(e));
            }
            Err(e) => {
                error!("Stopping watcher: {}", e);
                return Err(e.into());
            }
        }

        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal, shutting down...");
                return Ok(());
            }
        }
    }
}
