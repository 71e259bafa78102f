pub mod bigquery;

use alloy_json_abi::Event;
use alloy_primitives::Address;
use async_trait::async_trait;

use crate::models::contract::Filter;
use crate::models::errors::RepositoryError;
use crate::models::logs::{MethodResult, TransformedLog, WatchedEvent};

#[async_trait]
pub trait FilterRepository: Send + Sync {
    /// Registers a filter. Creating a filter whose name already exists is a no-op.
    async fn create_filter(&self, filter: &Filter) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait WatchedEventRepository: Send + Sync {
    async fn get_watched_events(&self, filter_name: &str) -> Result<Vec<WatchedEvent>, RepositoryError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn persist_logs(
        &self,
        logs: &[TransformedLog],
        event: &Event,
        address: Address,
        contract_name: &str,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MethodRepository: Send + Sync {
    async fn persist_results(&self, results: &[MethodResult]) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait BlockRetriever: Send + Sync {
    /// First block at which `address` shows up in the captured logs.
    async fn retrieve_first_block(&self, address: Address) -> Result<u64, RepositoryError>;

    /// Highest block captured so far.
    async fn retrieve_most_recent_block(&self) -> Result<u64, RepositoryError>;
}
