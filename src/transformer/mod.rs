//! The contract watcher's orchestrator.
//!
//! `init` builds one [`Contract`] per configured address and registers its log
//! filters. Each `execute` call then drains the logs captured for those filters
//! through the converter into the event store and polls the selected methods at
//! the block the cycle started from. Every collaborator call is awaited in turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use alloy_dyn_abi::DynSolValue;
use alloy_json_abi::JsonAbi;
use alloy_primitives::Address;
use alloy_provider::Provider;
use tracing::{debug, info, warn};

use crate::converter::{Converter, LogConverter};
use crate::metrics::Metrics;
use crate::models::common::{AbiLookupConfig, ContractConfig};
use crate::models::contract::Contract;
use crate::models::errors::{NameLookupError, TransformerError};
use crate::parser::{AbiParser, Parser};
use crate::poller::{MethodPoller, Poller};
use crate::storage::bigquery::BigQueryStore;
use crate::storage::{BlockRetriever, EventRepository, FilterRepository, WatchedEventRepository};
use crate::utils::render_value;

/// Collaborators a [`Transformer`] is assembled from.
pub struct TransformerParts {
    pub parser: Box<dyn Parser>,
    pub poller: Box<dyn Poller>,
    pub converter: Box<dyn Converter>,
    pub block_retriever: Arc<dyn BlockRetriever>,
    pub filter_repository: Arc<dyn FilterRepository>,
    pub watched_event_repository: Arc<dyn WatchedEventRepository>,
    pub event_repository: Arc<dyn EventRepository>,
}

pub struct Transformer {
    config: ContractConfig,
    parser: Box<dyn Parser>,
    poller: Box<dyn Poller>,
    converter: Box<dyn Converter>,
    block_retriever: Arc<dyn BlockRetriever>,
    filter_repository: Arc<dyn FilterRepository>,
    watched_event_repository: Arc<dyn WatchedEventRepository>,
    event_repository: Arc<dyn EventRepository>,
    contracts: HashMap<Address, Contract>,
    last_block: Option<u64>,
    metrics: Option<Arc<Metrics>>,
}

impl Transformer {
    /// Wires the explorer ABI parser, the `eth_call` poller, the log converter
    /// and BigQuery storage.
    pub fn new<P>(
        config: ContractConfig,
        provider: P,
        store: BigQueryStore,
        abi_lookup: &AbiLookupConfig,
        max_blocks_per_cycle: u64,
    ) -> Self
    where
        P: Provider + 'static,
    {
        let store = Arc::new(store);
        let poller = MethodPoller::new(provider, store.clone())
            .with_max_blocks_per_cycle(max_blocks_per_cycle);

        let parts = TransformerParts {
            parser: Box::new(AbiParser::new(&config.network, abi_lookup)),
            poller: Box::new(poller),
            converter: Box::new(LogConverter::new()),
            block_retriever: store.clone(),
            filter_repository: store.clone(),
            watched_event_repository: store.clone(),
            event_repository: store,
        };
        Self::from_parts(config, parts)
    }

    pub fn from_parts(config: ContractConfig, parts: TransformerParts) -> Self {
        Self {
            config,
            parser: parts.parser,
            poller: parts.poller,
            converter: parts.converter,
            block_retriever: parts.block_retriever,
            filter_repository: parts.filter_repository,
            watched_event_repository: parts.watched_event_repository,
            event_repository: parts.event_repository,
            contracts: HashMap::new(),
            last_block: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ContractConfig {
        &self.config
    }

    pub fn contracts(&self) -> &HashMap<Address, Contract> {
        &self.contracts
    }

    pub fn contract(&self, address: &Address) -> Option<&Contract> {
        self.contracts.get(address)
    }

    /// Block the watcher has processed through. Unset until `init` completes.
    pub fn last_block(&self) -> Option<u64> {
        self.last_block
    }

    /// Builds a contract for every configured address and registers its
    /// filters, then sets the cursor to the most recent captured block.
    pub async fn init(&mut self) -> Result<(), TransformerError> {
        let mut addresses: Vec<Address> = self.config.addresses().copied().collect();
        addresses.sort();

        for address in addresses {
            let Some(watched) = self.config.contracts.get(&address).cloned() else {
                continue;
            };

            let abi = if watched.abi.trim().is_empty() {
                self.parser.parse(address).await
            } else {
                self.parser.parse_abi_str(&watched.abi)
            }
            .map_err(|source| TransformerError::Abi { address, source })?;

            let mut first_block = self
                .block_retriever
                .retrieve_first_block(address)
                .await
                .map_err(|source| TransformerError::FirstBlock { address, source })?;
            if first_block < watched.start_block {
                first_block = watched.start_block;
            }

            let name = match self.lookup_name(&abi.parsed, address).await {
                Ok(name) => name,
                Err(e) => {
                    warn!("{}", e);
                    String::new()
                }
            };

            let mut contract = Contract {
                name,
                network: self.config.network.clone(),
                address,
                abi: abi.raw.clone(),
                parsed_abi: abi.parsed.clone(),
                starting_block: first_block,
                events: abi.events(&watched.events),
                methods: abi.select_methods(&watched.methods),
                filter_args: watched.event_args.iter().cloned().collect(),
                method_args: watched.method_args.iter().cloned().collect(),
                piping: watched.piping,
                filters: HashMap::new(),
                emitted_addrs: None,
            }
            .init();

            contract
                .generate_filters()
                .map_err(|source| TransformerError::Filters { address, source })?;

            let mut filters: Vec<_> = contract.filters.values().collect();
            filters.sort_by(|a, b| a.name.cmp(&b.name));
            for filter in filters {
                self.filter_repository
                    .create_filter(filter)
                    .await
                    .map_err(|source| TransformerError::CreateFilter {
                        name: filter.name.clone(),
                        source,
                    })?;
                debug!("Created filter '{}' from block {}", filter.name, filter.from_block);
            }

            if let Some(metrics) = &self.metrics {
                metrics
                    .filters_created
                    .add(contract.filters.len() as u64, &metrics.labels());
            }

            info!(
                "Watching contract {} ({}) from block {} with {} filter(s) and {} method(s)",
                address,
                if contract.name.is_empty() { "unnamed" } else { contract.name.as_str() },
                contract.starting_block,
                contract.filters.len(),
                contract.methods.len()
            );
            self.contracts.insert(address, contract);
        }

        self.refresh_cursor().await?;

        if let Some(metrics) = &self.metrics {
            metrics
                .contracts_watched
                .record(self.contracts.len() as u64, &metrics.labels());
        }
        info!(
            "Initialized {} contract(s), cursor at block {:?}",
            self.contracts.len(),
            self.last_block
        );
        Ok(())
    }

    /// Runs one cycle over every contract, then advances the cursor. Methods
    /// are polled at the cursor the cycle started with.
    pub async fn execute(&mut self) -> Result<(), TransformerError> {
        if self.contracts.is_empty() {
            return Err(TransformerError::NoContracts);
        }
        let cursor = self.last_block.ok_or(TransformerError::CursorUnset)?;
        let cycle_start = Instant::now();

        let mut addresses: Vec<Address> = self.contracts.keys().copied().collect();
        addresses.sort();

        for address in addresses {
            let Some(contract) = self.contracts.get(&address) else {
                continue;
            };
            self.converter.update(contract);

            let mut filters: Vec<(&String, &String)> = contract
                .filters
                .iter()
                .map(|(signature, filter)| (signature, &filter.name))
                .collect();
            filters.sort_by(|a, b| a.1.cmp(b.1));

            let (mut converted, mut skipped, mut persisted) = (0u64, 0u64, 0u64);
            let mut emitted = Vec::new();
            for (signature, filter_name) in filters {
                let event = contract.events.get(signature).ok_or_else(|| {
                    TransformerError::MissingEvent {
                        address,
                        signature: signature.clone(),
                    }
                })?;

                let watched_events = self
                    .watched_event_repository
                    .get_watched_events(filter_name)
                    .await
                    .map_err(|source| TransformerError::WatchedEvents {
                        name: filter_name.clone(),
                        source,
                    })?;

                for watched_event in &watched_events {
                    let record = self
                        .converter
                        .convert(watched_event, event)
                        .map_err(|source| TransformerError::Convert {
                            name: filter_name.clone(),
                            source,
                        })?;
                    let Some(record) = record else {
                        debug!(
                            "Skipping '{}' log {} at block {}",
                            event.name, watched_event.log_index, watched_event.block_number
                        );
                        skipped += 1;
                        continue;
                    };
                    converted += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.logs_converted.add(1, &metrics.labels());
                    }

                    self.event_repository
                        .persist_logs(std::slice::from_ref(&record), event, address, &contract.name)
                        .await
                        .map_err(|source| TransformerError::PersistLogs {
                            address,
                            event: event.name.clone(),
                            source,
                        })?;
                    persisted += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.logs_persisted.add(1, &metrics.labels());
                    }
                    emitted.extend(record.emitted_addrs);
                }
            }

            info!(
                "Contract {}: {} log(s) converted, {} persisted, {} skipped",
                address, converted, persisted, skipped
            );
            if let Some(metrics) = &self.metrics {
                metrics.logs_skipped.add(skipped, &metrics.labels());
            }

            let Some(contract) = self.contracts.get_mut(&address) else {
                continue;
            };
            contract.add_emitted_addrs(emitted);

            self.poller
                .poll_contract(contract, cursor)
                .await
                .map_err(|source| TransformerError::Poll { address, source })?;
            if let Some(metrics) = &self.metrics {
                metrics.method_polls.add(1, &metrics.labels());
            }
        }

        self.refresh_cursor().await?;

        if let Some(metrics) = &self.metrics {
            metrics.cycles_completed.add(1, &metrics.labels());
            metrics
                .cycle_duration
                .record(cycle_start.elapsed().as_secs_f64(), &metrics.labels());
        }
        Ok(())
    }

    async fn lookup_name(&self, abi: &JsonAbi, address: Address) -> Result<String, NameLookupError> {
        let output = self
            .poller
            .fetch_contract_data(abi, address, "name", &[], self.last_block)
            .await
            .map_err(|source| NameLookupError { address, source })?;

        Ok(match output.first() {
            Some(DynSolValue::String(name)) => name.clone(),
            Some(value) => render_value(value),
            None => String::new(),
        })
    }

    // The cursor never moves backwards
    async fn refresh_cursor(&mut self) -> Result<(), TransformerError> {
        let latest = self
            .block_retriever
            .retrieve_most_recent_block()
            .await
            .map_err(TransformerError::MostRecentBlock)?;

        match self.last_block {
            Some(current) if latest < current => {
                warn!(
                    "Most recent block {} is behind the cursor at {}, keeping the cursor",
                    latest, current
                );
            }
            _ => self.last_block = Some(latest),
        }

        if let (Some(metrics), Some(cursor)) = (&self.metrics, self.last_block) {
            metrics.cursor_block.record(cursor, &metrics.labels());
        }
        Ok(())
    }
}
