use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::connection::{ConnectionConfig, StreamRequest};
use crate::protocol::{cell_as_string, cell_as_u64, QueryError, QueryResult};
use crate::query_execution::{ExecutionError, ProgressCallback, QueryExecution};
use crate::saved_queries::{SavedQuery, SavedQueryStore};
use crate::storage::StorageError;
use crate::transport::EventTransport;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("result is missing column `{0}`")]
    MissingColumn(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableInfo {
    pub database: String,
    pub name: String,
    pub engine: String,
    pub metadata_modification_time: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableStats {
    pub bytes: u64,
    pub rows: u64,
    pub primary_key_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition: String,
    pub rows: u64,
    pub bytes: u64,
}

/// Streaming query client bound to one connection identity.
///
/// `connect` only records the identity; every [`QueryClient::execute_query`]
/// opens its own event stream through the configured transport.
pub struct QueryClient {
    config: ConnectionConfig,
    transport: Arc<dyn EventTransport>,
    saved_queries: Arc<dyn SavedQueryStore>,
}

impl QueryClient {
    #[must_use]
    pub fn connect(
        config: ConnectionConfig,
        transport: Arc<dyn EventTransport>,
        saved_queries: Arc<dyn SavedQueryStore>,
    ) -> Self {
        tracing::debug!(
            api_url = %config.api_url,
            target_url = %config.target_url,
            "recorded connection"
        );
        Self {
            config,
            transport,
            saved_queries,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Starts a streamed query and returns immediately.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn execute_query(
        &self,
        query: &str,
        database: &str,
        on_progress: Option<ProgressCallback>,
    ) -> QueryExecution {
        let request = StreamRequest::new(&self.config, query, database, on_progress.is_some());
        QueryExecution::start(Arc::clone(&self.transport), request, on_progress)
    }

    pub fn saved_queries(&self) -> Result<Vec<SavedQuery>, StorageError> {
        self.saved_queries.list()
    }

    pub fn save_saved_query(&self, name: &str, contents: &str) -> Result<(), StorageError> {
        self.saved_queries.save(name, contents)
    }

    pub fn delete_saved_query(&self, name: &str) -> Result<bool, StorageError> {
        self.saved_queries.delete(name)
    }

    pub async fn databases(&self) -> Result<Vec<String>, ClientError> {
        let result = self
            .fetch("SELECT name FROM system.databases ORDER BY name", "default")
            .await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(cell_as_string))
            .collect())
    }

    /// `local_only` leaves out `Distributed` tables, which hold no parts of
    /// their own.
    pub async fn tables(
        &self,
        database: &str,
        local_only: bool,
    ) -> Result<Vec<TableInfo>, ClientError> {
        let mut sql = format!(
            "SELECT database, name, engine, \
             toString(metadata_modification_time) AS metadata_modification_time \
             FROM system.tables WHERE database = {}",
            quote_literal(database)
        );
        if local_only {
            sql.push_str(" AND engine != 'Distributed'");
        }
        sql.push_str(" ORDER BY name");

        let result = self.fetch(&sql, database).await?;
        result
            .records()
            .iter()
            .map(|record| {
                Ok(TableInfo {
                    database: string_field(record, "database")?,
                    name: string_field(record, "name")?,
                    engine: string_field(record, "engine")?,
                    metadata_modification_time: string_field(
                        record,
                        "metadata_modification_time",
                    )?,
                })
            })
            .collect()
    }

    /// `None` when the table has no active parts.
    pub async fn table_stats(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Option<TableStats>, ClientError> {
        let sql = format!(
            "SELECT sum(bytes_on_disk) AS bytes, \
             sum(primary_key_bytes_in_memory) AS primary_key_bytes, \
             toString(sum(rows)) AS rows \
             FROM system.parts \
             WHERE database = {} AND table = {} AND active \
             GROUP BY table",
            quote_literal(database),
            quote_literal(table)
        );

        let result = self.fetch(&sql, database).await?;
        let Some(record) = result.records().into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(TableStats {
            bytes: u64_field(&record, "bytes")?,
            rows: u64_field(&record, "rows")?,
            primary_key_bytes: u64_field(&record, "primary_key_bytes")?,
        }))
    }

    pub async fn table_columns(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, ClientError> {
        let sql = format!(
            "SELECT name, type, data_compressed_bytes AS compressed, \
             data_uncompressed_bytes AS uncompressed \
             FROM system.columns WHERE database = {} AND table = {} \
             ORDER BY position",
            quote_literal(database),
            quote_literal(table)
        );

        let result = self.fetch(&sql, database).await?;
        result
            .records()
            .iter()
            .map(|record| {
                Ok(ColumnInfo {
                    name: string_field(record, "name")?,
                    data_type: string_field(record, "type")?,
                    compressed_bytes: u64_field(record, "compressed")?,
                    uncompressed_bytes: u64_field(record, "uncompressed")?,
                })
            })
            .collect()
    }

    pub async fn table_partitions(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<PartitionInfo>, ClientError> {
        let sql = format!(
            "SELECT partition, sum(rows) AS rows, sum(bytes_on_disk) AS bytes \
             FROM system.parts WHERE database = {} AND table = {} AND active \
             GROUP BY partition ORDER BY partition",
            quote_literal(database),
            quote_literal(table)
        );

        let result = self.fetch(&sql, database).await?;
        result
            .records()
            .iter()
            .map(|record| {
                Ok(PartitionInfo {
                    partition: string_field(record, "partition")?,
                    rows: u64_field(record, "rows")?,
                    bytes: u64_field(record, "bytes")?,
                })
            })
            .collect()
    }

    async fn fetch(&self, sql: &str, database: &str) -> Result<Arc<QueryResult>, ClientError> {
        let result = self.execute_query(sql, database, None).get().await?;
        if let Some(error) = &result.error {
            return Err(ClientError::Query(error.clone()));
        }
        Ok(result)
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Single-quoted SQL string literal with backslashes and quotes escaped.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            other => quoted.push(other),
        }
    }
    quoted.push('\'');
    quoted
}

fn string_field(record: &Map<String, Value>, name: &str) -> Result<String, ClientError> {
    record
        .get(name)
        .and_then(cell_as_string)
        .ok_or_else(|| ClientError::MissingColumn(name.to_string()))
}

fn u64_field(record: &Map<String, Value>, name: &str) -> Result<u64, ClientError> {
    record
        .get(name)
        .and_then(cell_as_u64)
        .ok_or_else(|| ClientError::MissingColumn(name.to_string()))
}
