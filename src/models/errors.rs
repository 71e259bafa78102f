use alloy_primitives::Address;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Invalid ABI JSON: {0}")]
    InvalidAbi(#[from] serde_json::Error),
    #[error("ABI lookup request for {address} failed: {message}")]
    Request { address: Address, message: String },
    #[error("ABI lookup for {address} was rejected: {message}")]
    Lookup { address: Address, message: String },
}

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("No events selected for contract {address}, no filters created")]
    NoEvents { address: Address },
    #[error("Event '{name}' is anonymous and has no topic to filter on")]
    AnonymousEvent { name: String },
}

#[derive(Error, Debug)]
pub enum ConverterError {
    #[error("Converter has no active contract")]
    NoActiveContract,
    #[error("Log at block {block_number} was emitted by {got}, expected {expected}")]
    AddressMismatch {
        block_number: u64,
        expected: Address,
        got: Address,
    },
    #[error("Log at block {block_number} has more than 4 topics")]
    TooManyTopics { block_number: u64 },
    #[error("Failed to decode '{event}' log at block {block_number}: {source}")]
    Decode {
        event: String,
        block_number: u64,
        #[source]
        source: alloy_dyn_abi::Error,
    },
    #[error("Decoded {got} values for '{event}', expected {expected}")]
    ValueCount {
        event: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Error, Debug)]
pub enum PollerError {
    #[error("Method '{method}' with {args} argument(s) not found in ABI")]
    MethodNotFound { method: String, args: usize },
    #[error("Method '{method}' has an unsupported argument shape")]
    UnsupportedMethod { method: String },
    #[error("ABI coding error for '{method}': {source}")]
    Abi {
        method: String,
        #[source]
        source: alloy_dyn_abi::Error,
    },
    #[error("eth_call to {address} for '{method}' failed: {source}")]
    Call {
        address: Address,
        method: String,
        #[source]
        source: alloy_transport::TransportError,
    },
    #[error("Failed to persist results of '{method}': {source}")]
    Persist {
        method: String,
        #[source]
        source: RepositoryError,
    },
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Query failed: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid value in column '{column}': {reason}")]
    Decode { column: String, reason: String },
}

/// Failure of the best-effort contract name lookup. Deliberately not
/// convertible into [`TransformerError`].
#[derive(Error, Debug)]
#[error("Unable to fetch name of contract {address}: {source}")]
pub struct NameLookupError {
    pub address: Address,
    #[source]
    pub source: PollerError,
}

#[derive(Error, Debug)]
pub enum TransformerError {
    #[error("Transformer has no initialized contracts to work with")]
    NoContracts,
    #[error("Transformer cursor is unset; init did not complete")]
    CursorUnset,
    #[error("Failed to resolve ABI for {address}: {source}")]
    Abi {
        address: Address,
        #[source]
        source: ParserError,
    },
    #[error("Failed to retrieve first block for {address}: {source}")]
    FirstBlock {
        address: Address,
        #[source]
        source: RepositoryError,
    },
    #[error("Failed to retrieve most recent block: {0}")]
    MostRecentBlock(#[source] RepositoryError),
    #[error("Failed to generate filters for {address}: {source}")]
    Filters {
        address: Address,
        #[source]
        source: ContractError,
    },
    #[error("Failed to create filter '{name}': {source}")]
    CreateFilter {
        name: String,
        #[source]
        source: RepositoryError,
    },
    #[error("Failed to fetch watched events for filter '{name}': {source}")]
    WatchedEvents {
        name: String,
        #[source]
        source: RepositoryError,
    },
    #[error("No event with signature '{signature}' on contract {address}")]
    MissingEvent { address: Address, signature: String },
    #[error("Failed to convert log for filter '{name}': {source}")]
    Convert {
        name: String,
        #[source]
        source: ConverterError,
    },
    #[error("Failed to persist '{event}' log for {address}: {source}")]
    PersistLogs {
        address: Address,
        event: String,
        #[source]
        source: RepositoryError,
    },
    #[error("Failed to poll methods of {address}: {source}")]
    Poll {
        address: Address,
        #[source]
        source: PollerError,
    },
}

impl TransformerError {
    /// Usage errors will fail the same way on every call; everything else may
    /// succeed if the cycle is re-run.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NoContracts | Self::CursorUnset)
    }
}
