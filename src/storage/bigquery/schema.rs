use google_cloud_bigquery::http::table::{
    TableFieldMode, TableFieldSchema, TableFieldType, TableSchema,
};

fn field(
    name: &str,
    data_type: TableFieldType,
    mode: TableFieldMode,
    description: &str,
) -> TableFieldSchema {
    TableFieldSchema {
        name: name.to_string(),
        data_type,
        mode: Some(mode),
        description: Some(description.to_string()),
        ..Default::default()
    }
}

pub fn filter_schema() -> TableSchema {
    let fields = vec![
        field("name", TableFieldType::String, TableFieldMode::Required, "Unique filter name"),
        field(
            "from_block",
            TableFieldType::Integer,
            TableFieldMode::Required,
            "First block the filter applies to",
        ),
        field(
            "to_block",
            TableFieldType::Integer,
            TableFieldMode::Nullable,
            "Last block the filter applies to, NULL follows the chain head",
        ),
        field(
            "address",
            TableFieldType::String,
            TableFieldMode::Required,
            "Lowercase address of the watched contract",
        ),
        field(
            "topic0",
            TableFieldType::String,
            TableFieldMode::Nullable,
            "Event selector the filter matches",
        ),
        field(
            "topics",
            TableFieldType::String,
            TableFieldMode::Required,
            "JSON array of all filter topics",
        ),
        field(
            "created_at",
            TableFieldType::Timestamp,
            TableFieldMode::Required,
            "Time the filter was registered",
        ),
    ];

    TableSchema { fields }
}

pub fn event_schema() -> TableSchema {
    let fields = vec![
        field("id", TableFieldType::String, TableFieldMode::Required, "Unique record ID"),
        field(
            "contract_address",
            TableFieldType::String,
            TableFieldMode::Required,
            "Address of the contract that emitted the event",
        ),
        field(
            "contract_name",
            TableFieldType::String,
            TableFieldMode::Nullable,
            "Name reported by the contract, if any",
        ),
        field("event_name", TableFieldType::String, TableFieldMode::Required, "Event name"),
        field(
            "event_signature",
            TableFieldType::String,
            TableFieldMode::Required,
            "Canonical event signature",
        ),
        field(
            "block_number",
            TableFieldType::Integer,
            TableFieldMode::Required,
            "Number of the block containing the log",
        ),
        field(
            "block_time",
            TableFieldType::Timestamp,
            TableFieldMode::Nullable,
            "Timestamp of the block containing the log",
        ),
        field("tx_hash", TableFieldType::String, TableFieldMode::Required, "Transaction hash"),
        field(
            "tx_index",
            TableFieldType::Integer,
            TableFieldMode::Required,
            "Index of the transaction in the block",
        ),
        field(
            "log_index",
            TableFieldType::Integer,
            TableFieldMode::Required,
            "Index of the log in the block",
        ),
        field(
            "arguments",
            TableFieldType::String,
            TableFieldMode::Required,
            "JSON object of decoded event arguments",
        ),
        field(
            "created_at",
            TableFieldType::Timestamp,
            TableFieldMode::Required,
            "Time the record was written",
        ),
    ];

    TableSchema { fields }
}

pub fn method_schema() -> TableSchema {
    let fields = vec![
        field("id", TableFieldType::String, TableFieldMode::Required, "Unique record ID"),
        field(
            "contract_address",
            TableFieldType::String,
            TableFieldMode::Required,
            "Address of the polled contract",
        ),
        field(
            "contract_name",
            TableFieldType::String,
            TableFieldMode::Nullable,
            "Name reported by the contract, if any",
        ),
        field("method", TableFieldType::String, TableFieldMode::Required, "Method name"),
        field(
            "arguments",
            TableFieldType::String,
            TableFieldMode::Required,
            "JSON array of call arguments",
        ),
        field(
            "block_number",
            TableFieldType::Integer,
            TableFieldMode::Required,
            "Block the call was made at",
        ),
        field(
            "output",
            TableFieldType::String,
            TableFieldMode::Required,
            "JSON array of decoded return values",
        ),
        field(
            "created_at",
            TableFieldType::Timestamp,
            TableFieldMode::Required,
            "Time the record was written",
        ),
    ];

    TableSchema { fields }
}
