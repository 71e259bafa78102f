use std::collections::{BTreeMap, HashSet};

use alloy_dyn_abi::{DynSolValue, EventExt};
use alloy_json_abi::Event;
use alloy_primitives::{Address, LogData};

use crate::models::contract::Contract;
use crate::models::errors::ConverterError;
use crate::models::logs::{TransformedLog, WatchedEvent};
use crate::utils::render_value;

/// Turns watched event logs into [`TransformedLog`]s for one contract at a time.
pub trait Converter: Send + Sync {
    /// Switches the contract that subsequent logs belong to.
    fn update(&mut self, contract: &Contract);

    /// Returns `Ok(None)` for logs that should not be persisted.
    fn convert(
        &self,
        watched_event: &WatchedEvent,
        event: &Event,
    ) -> Result<Option<TransformedLog>, ConverterError>;
}

#[derive(Debug, Clone)]
struct ActiveContract {
    address: Address,
    filter_args: HashSet<String>, // Lowercased
}

#[derive(Debug, Default)]
pub struct LogConverter {
    contract: Option<ActiveContract>,
}

impl LogConverter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Converter for LogConverter {
    fn update(&mut self, contract: &Contract) {
        self.contract = Some(ActiveContract {
            address: contract.address,
            filter_args: contract
                .filter_args
                .iter()
                .map(|arg| arg.to_lowercase())
                .collect(),
        });
    }

    fn convert(
        &self,
        watched_event: &WatchedEvent,
        event: &Event,
    ) -> Result<Option<TransformedLog>, ConverterError> {
        let contract = self
            .contract
            .as_ref()
            .ok_or(ConverterError::NoActiveContract)?;

        if watched_event.address != contract.address {
            return Err(ConverterError::AddressMismatch {
                block_number: watched_event.block_number,
                expected: contract.address,
                got: watched_event.address,
            });
        }

        let log_data = LogData::new(watched_event.topics.clone(), watched_event.data.clone())
            .ok_or(ConverterError::TooManyTopics {
                block_number: watched_event.block_number,
            })?;
        let decoded = event
            .decode_log(&log_data)
            .map_err(|source| ConverterError::Decode {
                event: event.name.clone(),
                block_number: watched_event.block_number,
                source,
            })?;

        let got = decoded.indexed.len() + decoded.body.len();
        if got != event.inputs.len() {
            return Err(ConverterError::ValueCount {
                event: event.name.clone(),
                expected: event.inputs.len(),
                got,
            });
        }

        // Decoded values come back split into indexed and body; put them back in input order
        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut arguments = BTreeMap::new();
        let mut seen_addrs = Vec::new();
        for (i, input) in event.inputs.iter().enumerate() {
            let value = if input.indexed {
                indexed.next()
            } else {
                body.next()
            };
            let Some(value) = value else {
                continue;
            };
            if let DynSolValue::Address(address) = &value {
                seen_addrs.push(*address);
            }
            let name = if input.name.is_empty() {
                format!("arg{}", i)
            } else {
                input.name.clone()
            };
            arguments.insert(name, render_value(&value));
        }

        // Only keep logs that pass the contract's argument filter, if any
        if !passes_event_filter(&contract.filter_args, &arguments) {
            return Ok(None);
        }

        Ok(Some(TransformedLog {
            id: TransformedLog::record_id(
                &contract.address,
                &watched_event.tx_hash,
                watched_event.log_index,
            ),
            contract_address: contract.address,
            event_name: event.name.clone(),
            event_signature: event.signature(),
            block_number: watched_event.block_number,
            block_time: watched_event.block_time,
            tx_hash: watched_event.tx_hash,
            tx_index: watched_event.tx_index,
            log_index: watched_event.log_index,
            arguments,
            emitted_addrs: seen_addrs,
        }))
    }
}

fn passes_event_filter(filter_args: &HashSet<String>, arguments: &BTreeMap<String, String>) -> bool {
    filter_args.is_empty()
        || arguments
            .values()
            .any(|value| filter_args.contains(&value.to_lowercase()))
}
