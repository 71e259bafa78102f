use std::collections::HashMap;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbiLookupConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

/// One entry of the `contracts` list in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchedContract {
    pub address: Address,
    #[serde(default)]
    pub abi: String,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub event_args: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub method_args: Vec<String>,
    #[serde(default)]
    pub piping: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: String,
    pub rpc_url: String,
    pub dataset: String,
    pub source_dataset: String,
    pub dataset_location: String,
    pub poll_interval_ms: u64,
    pub max_blocks_per_cycle: u64,
    #[serde(default)]
    pub abi_lookup: AbiLookupConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub contracts: Vec<WatchedContract>,
}

impl Config {
    pub fn contract_config(&self) -> ContractConfig {
        let mut contracts = HashMap::with_capacity(self.contracts.len());
        for entry in &self.contracts {
            if contracts.insert(entry.address, entry.clone()).is_some() {
                warn!(
                    "Contract {} is configured more than once, using the last entry",
                    entry.address
                );
            }
        }
        ContractConfig {
            network: self.network.clone(),
            contracts,
        }
    }
}

/// Per-address watch configuration consumed by the transformer.
#[derive(Debug, Clone, Default)]
pub struct ContractConfig {
    pub network: String,
    pub contracts: HashMap<Address, WatchedContract>,
}

impl ContractConfig {
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.contracts.keys()
    }
}
