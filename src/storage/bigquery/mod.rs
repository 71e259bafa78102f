mod schema;

use alloy_json_abi::Event;
use alloy_primitives::{Address, B256, Bytes};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_cloud_bigquery::client::{Client, ClientConfig};
use google_cloud_bigquery::http::{
    dataset::{Dataset, DatasetReference},
    error::Error as BigQueryError,
    job::{get_query_results::GetQueryResultsRequest, query::QueryRequest},
    table::{Table as BigQueryTable, TableReference, TableSchema},
    tabledata::list::{Tuple, Value},
};
use once_cell::sync::OnceCell;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::contract::Filter;
use crate::models::errors::RepositoryError;
use crate::models::logs::{MethodResult, TransformedLog, WatchedEvent};
use crate::storage::bigquery::schema::{event_schema, filter_schema, method_schema};
use crate::storage::{
    BlockRetriever, EventRepository, FilterRepository, MethodRepository, WatchedEventRepository,
};
use crate::utils::retry::{RetryConfig, retry, retry_if};

const FILTERS_TABLE: &str = "log_filters";
const EVENTS_TABLE: &str = "contract_events";
const METHODS_TABLE: &str = "method_results";
const SOURCE_LOGS_TABLE: &str = "logs";

// Define a static OnceCell to hold the shared Client and Project ID
static BIGQUERY_CLIENT: OnceCell<Arc<(Client, String)>> = OnceCell::new();

// Initializes and returns the shared BigQuery Client and Project ID.
// This function ensures that the Client is initialized only once.
pub async fn get_client() -> Result<Arc<(Client, String)>> {
    if let Some(client) = BIGQUERY_CLIENT.get() {
        return Ok(client.clone());
    }

    let (config, project_id_option) = ClientConfig::new_with_auth().await?;
    let client = Client::new(config).await?;
    let project_id = project_id_option.ok_or_else(|| anyhow::anyhow!("Project ID not found"))?;

    let client_arc = Arc::new((client, project_id));

    match BIGQUERY_CLIENT.set(client_arc.clone()) {
        Ok(()) => {
            info!(
                "Initialized and cached BigQuery client for Project ID: {}",
                client_arc.1
            );
            Ok(client_arc)
        }
        // Another task won the race, use its client
        Err(_) => Ok(BIGQUERY_CLIENT.get().cloned().unwrap_or(client_arc)),
    }
}

/// Filter, event and method storage on BigQuery. Raw logs are read from the
/// `logs` table the block indexer writes into `source_dataset`.
#[derive(Clone)]
pub struct BigQueryStore {
    client: Arc<(Client, String)>,
    dataset: String,
    source_dataset: String,
    location: String,
}

impl BigQueryStore {
    pub async fn connect(dataset: &str, source_dataset: &str, location: &str) -> Result<Self> {
        Ok(Self {
            client: get_client().await?,
            dataset: dataset.to_string(),
            source_dataset: source_dataset.to_string(),
            location: location.to_string(),
        })
    }

    fn project_id(&self) -> &str {
        &self.client.1
    }

    fn table(&self, table_id: &str) -> String {
        format!("`{}.{}.{}`", self.project_id(), self.dataset, table_id)
    }

    fn source_logs(&self) -> String {
        format!(
            "`{}.{}.{}`",
            self.project_id(),
            self.source_dataset,
            SOURCE_LOGS_TABLE
        )
    }

    // Create the watcher dataset and its tables. Handles existing ones.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing storage in dataset: {}", self.dataset);

        self.create_dataset().await?;
        self.create_table(FILTERS_TABLE, filter_schema()).await?;
        self.create_table(EVENTS_TABLE, event_schema()).await?;
        self.create_table(METHODS_TABLE, method_schema()).await?;

        info!("Storage initialized successfully");
        Ok(())
    }

    async fn create_dataset(&self) -> Result<()> {
        let (client, project_id) = &*self.client;
        let metadata = Dataset {
            dataset_reference: DatasetReference {
                project_id: project_id.clone(),
                dataset_id: self.dataset.clone(),
            },
            location: self.location.clone(),
            ..Default::default()
        };

        let retry_config = RetryConfig::default();
        retry(
            || async {
                match client.dataset().create(&metadata).await {
                    Ok(_) => {
                        info!(
                            "Dataset successfully created: {}, project_id: {}",
                            self.dataset, project_id
                        );
                        Ok::<(), anyhow::Error>(())
                    }
                    Err(BigQueryError::Response(resp)) if resp.message.contains("Already Exists") => {
                        info!("Dataset '{}' already exists", self.dataset);
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            },
            &retry_config,
            "create_dataset",
        )
        .await
    }

    async fn create_table(&self, table_id: &str, schema: TableSchema) -> Result<()> {
        let (client, project_id) = &*self.client;
        let metadata = BigQueryTable {
            table_reference: TableReference {
                project_id: project_id.clone(),
                dataset_id: self.dataset.clone(),
                table_id: table_id.to_string(),
            },
            schema: Some(schema),
            ..Default::default()
        };

        let retry_config = RetryConfig::default();
        retry(
            || async {
                match client.table().create(&metadata).await {
                    Ok(_) => {
                        info!(
                            "Table '{}' successfully created in dataset '{}'",
                            table_id, self.dataset
                        );
                        Ok::<(), anyhow::Error>(())
                    }
                    Err(BigQueryError::Response(resp)) if resp.message.contains("Already Exists") => {
                        info!(
                            "Table '{}' already exists in dataset '{}'",
                            table_id, self.dataset
                        );
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            },
            &retry_config,
            "create_table",
        )
        .await
    }

    // Runs a query and reads every page of its result
    async fn query(&self, sql: String, context: &str) -> Result<Vec<Tuple>, RepositoryError> {
        let (client, project_id) = &*self.client;
        let request = QueryRequest {
            query: sql,
            ..Default::default()
        };
        debug!("Running BigQuery {}: {}", context, request.query);

        let retry_config = RetryConfig::default();
        let response = retry_if(
            || async {
                client
                    .job()
                    .query(project_id, &request)
                    .await
                    .map_err(anyhow::Error::from)
            },
            is_transient,
            &retry_config,
            context,
        )
        .await
        .map_err(|e| RepositoryError::Query(format!("{context}: {e:#}")))?;

        let job_id = response.job_reference.job_id.clone();
        let location = response.job_reference.location.clone();
        let first = ResultPage {
            job_complete: response.job_complete,
            rows: response.rows,
            page_token: response.page_token,
        };

        collect_pages(first, context, |page_token| {
            let request = GetQueryResultsRequest {
                page_token,
                location: location.clone(),
                ..Default::default()
            };
            let job_id = job_id.clone();
            let retry_config = &retry_config;
            async move {
                let response = retry_if(
                    || async {
                        client
                            .job()
                            .get_query_results(project_id, &job_id, &request)
                            .await
                            .map_err(anyhow::Error::from)
                    },
                    is_transient,
                    retry_config,
                    context,
                )
                .await
                .map_err(|e| RepositoryError::Query(format!("{context}: {e:#}")))?;

                Ok(ResultPage {
                    job_complete: response.job_complete,
                    rows: response.rows,
                    page_token: response.page_token,
                })
            }
        })
        .await
    }

    async fn query_block(&self, sql: String, context: &str, missing: String) -> Result<u64, RepositoryError> {
        let rows = self.query(sql, context).await?;
        let row = rows
            .first()
            .ok_or_else(|| RepositoryError::NotFound(missing.clone()))?;
        let value = cell(row, 0, "block_number")?.ok_or(RepositoryError::NotFound(missing))?;
        parse_u64(value, "block_number")
    }
}

// One response of `jobs.query` or `jobs.getQueryResults`
struct ResultPage {
    job_complete: bool,
    rows: Option<Vec<Tuple>>,
    page_token: Option<String>,
}

// Follows page tokens until the result is exhausted. `next_page(None)` waits
// on a job that was still running when the query call returned.
async fn collect_pages<F, Fut>(
    first: ResultPage,
    context: &str,
    mut next_page: F,
) -> Result<Vec<Tuple>, RepositoryError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<ResultPage, RepositoryError>>,
{
    let mut page = if first.job_complete {
        first
    } else {
        next_page(None).await?
    };

    let mut rows = Vec::new();
    loop {
        if !page.job_complete {
            return Err(RepositoryError::Query(format!(
                "{context}: query job did not complete"
            )));
        }
        rows.extend(page.rows.unwrap_or_default());
        match page.page_token {
            Some(token) if !token.is_empty() => page = next_page(Some(token)).await?,
            _ => return Ok(rows),
        }
    }
}

// Syntax errors and missing tables will not heal on retry
fn is_transient(error: &anyhow::Error) -> bool {
    let message = error.to_string();
    !(message.contains("Not found")
        || message.contains("Syntax error")
        || message.contains("Unrecognized name"))
}

#[async_trait]
impl FilterRepository for BigQueryStore {
    async fn create_filter(&self, filter: &Filter) -> Result<(), RepositoryError> {
        let sql = create_filter_sql(&self.table(FILTERS_TABLE), filter)?;
        self.query(sql, "create_filter").await?;
        debug!("Registered filter '{}'", filter.name);
        Ok(())
    }
}

#[async_trait]
impl WatchedEventRepository for BigQueryStore {
    async fn get_watched_events(&self, filter_name: &str) -> Result<Vec<WatchedEvent>, RepositoryError> {
        let sql = watched_events_sql(&self.source_logs(), &self.table(FILTERS_TABLE), filter_name);
        let rows = self.query(sql, "get_watched_events").await?;
        rows.iter()
            .map(|row| parse_watched_event(filter_name, row))
            .collect()
    }
}

#[async_trait]
impl EventRepository for BigQueryStore {
    async fn persist_logs(
        &self,
        logs: &[TransformedLog],
        event: &Event,
        address: Address,
        contract_name: &str,
    ) -> Result<(), RepositoryError> {
        if logs.is_empty() {
            return Ok(());
        }
        let sql = persist_logs_sql(&self.table(EVENTS_TABLE), logs, address, contract_name)?;
        self.query(sql, "persist_logs").await?;
        debug!(
            "Persisted {} '{}' log(s) for {}",
            logs.len(),
            event.name,
            address
        );
        Ok(())
    }
}

#[async_trait]
impl MethodRepository for BigQueryStore {
    async fn persist_results(&self, results: &[MethodResult]) -> Result<(), RepositoryError> {
        if results.is_empty() {
            return Ok(());
        }
        let sql = persist_results_sql(&self.table(METHODS_TABLE), results)?;
        self.query(sql, "persist_results").await?;
        Ok(())
    }
}

#[async_trait]
impl BlockRetriever for BigQueryStore {
    async fn retrieve_first_block(&self, address: Address) -> Result<u64, RepositoryError> {
        let sql = format!(
            "SELECT MIN(block_number) AS first_block FROM {} WHERE LOWER(address) = {}",
            self.source_logs(),
            quote(&lower(&address))
        );
        self.query_block(
            sql,
            "retrieve_first_block",
            format!("no logs captured for contract {}", address),
        )
        .await
    }

    async fn retrieve_most_recent_block(&self) -> Result<u64, RepositoryError> {
        let sql = format!(
            "SELECT MAX(block_number) AS last_block FROM {}",
            self.source_logs()
        );
        self.query_block(
            sql,
            "retrieve_most_recent_block",
            format!("no logs captured in {}", self.source_logs()),
        )
        .await
    }
}

////////////////////////////////////// SQL ////////////////////////////////////////

// Standard SQL string literal
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

fn lower(address: &Address) -> String {
    address.to_string().to_lowercase()
}

fn to_json<T: serde::Serialize>(value: &T, column: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Decode {
        column: column.to_string(),
        reason: e.to_string(),
    })
}

fn create_filter_sql(table: &str, filter: &Filter) -> Result<String, RepositoryError> {
    let to_block = filter
        .to_block
        .map_or("CAST(NULL AS INT64)".to_string(), |b| b.to_string());
    let topic0 = filter
        .topic0()
        .map_or("CAST(NULL AS STRING)".to_string(), |t| quote(&t.to_string()));
    let topics = to_json(&filter.topics, "topics")?;

    Ok(format!(
        "MERGE {table} AS t \
         USING (SELECT {name} AS name, {from_block} AS from_block, {to_block} AS to_block, \
         {address} AS address, {topic0} AS topic0, {topics} AS topics) AS s \
         ON t.name = s.name \
         WHEN NOT MATCHED THEN \
         INSERT (name, from_block, to_block, address, topic0, topics, created_at) \
         VALUES (s.name, s.from_block, s.to_block, s.address, s.topic0, s.topics, CURRENT_TIMESTAMP())",
        name = quote(&filter.name),
        from_block = filter.from_block,
        address = quote(&lower(&filter.address)),
        topics = quote(&topics),
    ))
}

fn watched_events_sql(logs_table: &str, filters_table: &str, filter_name: &str) -> String {
    format!(
        "SELECT l.block_number, UNIX_MICROS(l.block_time) AS block_time, l.tx_hash, l.tx_index, \
         l.log_index, l.address, TO_JSON_STRING(l.topics) AS topics, l.data \
         FROM {logs_table} AS l \
         JOIN {filters_table} AS f \
         ON LOWER(l.address) = f.address AND LOWER(l.topics[SAFE_OFFSET(0)]) = LOWER(f.topic0) \
         WHERE f.name = {name} \
         AND l.block_number >= f.from_block \
         AND (f.to_block IS NULL OR l.block_number <= f.to_block) \
         ORDER BY l.block_number, l.log_index",
        name = quote(filter_name),
    )
}

fn persist_logs_sql(
    table: &str,
    logs: &[TransformedLog],
    address: Address,
    contract_name: &str,
) -> Result<String, RepositoryError> {
    let mut rows = Vec::with_capacity(logs.len());
    for log in logs {
        let block_time = log.block_time.map_or("CAST(NULL AS TIMESTAMP)".to_string(), |t| {
            format!("TIMESTAMP_MICROS({})", t.timestamp_micros())
        });
        rows.push(format!(
            "SELECT {id} AS id, {address} AS contract_address, {name} AS contract_name, \
             {event_name} AS event_name, {event_signature} AS event_signature, \
             {block_number} AS block_number, {block_time} AS block_time, {tx_hash} AS tx_hash, \
             {tx_index} AS tx_index, {log_index} AS log_index, {arguments} AS arguments",
            id = quote(&log.id),
            address = quote(&lower(&address)),
            name = quote(contract_name),
            event_name = quote(&log.event_name),
            event_signature = quote(&log.event_signature),
            block_number = log.block_number,
            tx_hash = quote(&log.tx_hash.to_string()),
            tx_index = log.tx_index,
            log_index = log.log_index,
            arguments = quote(&to_json(&log.arguments, "arguments")?),
        ));
    }

    Ok(format!(
        "MERGE {table} AS t \
         USING ({rows}) AS s \
         ON t.id = s.id \
         WHEN NOT MATCHED THEN \
         INSERT (id, contract_address, contract_name, event_name, event_signature, block_number, \
         block_time, tx_hash, tx_index, log_index, arguments, created_at) \
         VALUES (s.id, s.contract_address, s.contract_name, s.event_name, s.event_signature, \
         s.block_number, s.block_time, s.tx_hash, s.tx_index, s.log_index, s.arguments, \
         CURRENT_TIMESTAMP())",
        rows = rows.join(" UNION ALL "),
    ))
}

fn persist_results_sql(table: &str, results: &[MethodResult]) -> Result<String, RepositoryError> {
    let mut rows = Vec::with_capacity(results.len());
    for result in results {
        rows.push(format!(
            "SELECT {id} AS id, {address} AS contract_address, {name} AS contract_name, \
             {method} AS method, {arguments} AS arguments, {block_number} AS block_number, \
             {output} AS output",
            id = quote(&result.id),
            address = quote(&lower(&result.contract_address)),
            name = quote(&result.contract_name),
            method = quote(&result.method),
            arguments = quote(&to_json(&result.arguments, "arguments")?),
            block_number = result.block_number,
            output = quote(&to_json(&result.output, "output")?),
        ));
    }

    Ok(format!(
        "MERGE {table} AS t \
         USING ({rows}) AS s \
         ON t.id = s.id \
         WHEN NOT MATCHED THEN \
         INSERT (id, contract_address, contract_name, method, arguments, block_number, output, created_at) \
         VALUES (s.id, s.contract_address, s.contract_name, s.method, s.arguments, s.block_number, \
         s.output, CURRENT_TIMESTAMP())",
        rows = rows.join(" UNION ALL "),
    ))
}

///////////////////////////////////// Rows /////////////////////////////////////////

fn cell<'a>(row: &'a Tuple, index: usize, column: &str) -> Result<Option<&'a str>, RepositoryError> {
    match row.f.get(index).map(|c| &c.v) {
        Some(Value::String(value)) => Ok(Some(value.as_str())),
        Some(Value::Null) => Ok(None),
        Some(_) => Err(RepositoryError::Decode {
            column: column.to_string(),
            reason: "expected a scalar value".to_string(),
        }),
        None => Err(RepositoryError::Decode {
            column: column.to_string(),
            reason: "missing column".to_string(),
        }),
    }
}

fn required<'a>(row: &'a Tuple, index: usize, column: &str) -> Result<&'a str, RepositoryError> {
    cell(row, index, column)?.ok_or_else(|| RepositoryError::Decode {
        column: column.to_string(),
        reason: "unexpected NULL".to_string(),
    })
}

fn parse_u64(value: &str, column: &str) -> Result<u64, RepositoryError> {
    value.parse().map_err(|e: std::num::ParseIntError| RepositoryError::Decode {
        column: column.to_string(),
        reason: e.to_string(),
    })
}

fn parse_hex<T>(value: &str, column: &str) -> Result<T, RepositoryError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| RepositoryError::Decode {
        column: column.to_string(),
        reason: e.to_string(),
    })
}

fn parse_watched_event(filter_name: &str, row: &Tuple) -> Result<WatchedEvent, RepositoryError> {
    let block_time = match cell(row, 1, "block_time")? {
        Some(micros) => {
            let micros: i64 = micros.parse().map_err(|e: std::num::ParseIntError| {
                RepositoryError::Decode {
                    column: "block_time".to_string(),
                    reason: e.to_string(),
                }
            })?;
            DateTime::<Utc>::from_timestamp(
                micros.div_euclid(1_000_000),
                (micros.rem_euclid(1_000_000) * 1_000) as u32,
            )
        }
        None => None,
    };

    let topics_json = required(row, 6, "topics")?;
    let topics: Vec<B256> =
        serde_json::from_str(topics_json).map_err(|e| RepositoryError::Decode {
            column: "topics".to_string(),
            reason: e.to_string(),
        })?;

    Ok(WatchedEvent {
        name: filter_name.to_string(),
        block_number: parse_u64(required(row, 0, "block_number")?, "block_number")?,
        block_time,
        tx_hash: parse_hex(required(row, 2, "tx_hash")?, "tx_hash")?,
        tx_index: parse_u64(required(row, 3, "tx_index")?, "tx_index")?,
        log_index: parse_u64(required(row, 4, "log_index")?, "log_index")?,
        address: parse_hex(required(row, 5, "address")?, "address")?,
        topics,
        data: parse_hex::<Bytes>(required(row, 7, "data")?, "data")?,
    })
}
