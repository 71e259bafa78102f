use std::collections::BTreeMap;

use alloy_primitives::{Address, B256, Bytes};
use chrono::{DateTime, Utc};
use serde::Serialize;

////////////////////////////////////// Raw Data ////////////////////////////////////////
// Log captured by the block indexer and matched to a watch filter
#[derive(Debug, Clone)]
pub struct WatchedEvent {
    pub name: String, // Filter name
    pub block_number: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub log_index: u64,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/////////////////////////////////// Transformed Data ///////////////////////////////////
// Final output format for one decoded event log
#[derive(Debug, Clone, Serialize)]
pub struct TransformedLog {
    pub id: String,
    pub contract_address: Address,
    pub event_name: String,
    pub event_signature: String,
    pub block_number: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub log_index: u64,
    pub arguments: BTreeMap<String, String>,
    #[serde(skip)]
    pub emitted_addrs: Vec<Address>,
}

impl TransformedLog {
    pub fn record_id(address: &Address, tx_hash: &B256, log_index: u64) -> String {
        format!("log-{}-{}-{}", address.to_string().to_lowercase(), tx_hash, log_index)
    }
}

// Result of one polled method call
#[derive(Debug, Clone, Serialize)]
pub struct MethodResult {
    pub id: String,
    pub contract_address: Address,
    pub contract_name: String,
    pub method: String,
    pub arguments: Vec<String>,
    pub block_number: u64,
    pub output: Vec<String>,
}

impl MethodResult {
    pub fn record_id(address: &Address, method: &str, arguments: &[String], block_number: u64) -> String {
        let mut id = format!("call-{}-{}", address.to_string().to_lowercase(), method);
        for argument in arguments {
            id.push('-');
            id.push_str(&argument.to_lowercase());
        }
        id.push('-');
        id.push_str(&block_number.to_string());
        id
    }
}
