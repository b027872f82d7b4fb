pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDataStore;
pub use sqlite::SqliteDataStore;

use crate::catalog::SchemaCatalog;
use crate::compiler::CompiledStatement;
use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_ROWS: usize = 10_000;
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A read-only store that can describe itself and run compiled statements.
#[async_trait]
pub trait DataStoreClient: Send + Sync {
    /// Identifier questions use to address this store.
    fn database_id(&self) -> &str;

    /// Reads tables and columns into a fresh [`SchemaCatalog`].
    async fn introspect(&self) -> Result<SchemaCatalog, DataStoreError>;

    /// Runs one statement with its parameters bound, never interpolated.
    ///
    /// A statement that outlives `limits.timeout` is cancelled and any
    /// partial rows are dropped.
    async fn execute(
        &self,
        statement: &CompiledStatement,
        limits: &ExecutionLimits,
    ) -> Result<ResultSet, ExecutionFault>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub max_rows: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// More rows were available than `max_rows`.
    pub truncated: bool,
}

/// One result row. Serializes as a JSON object keeping column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Serialize for Row {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|idx| self.values.get(idx))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionFault {
    #[error("Query exceeded the {0:?} execution limit")]
    Timeout(Duration),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Introspection error: {0}")]
    IntrospectionError(String),
}
