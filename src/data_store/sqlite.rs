use crate::catalog::{ColumnSchema, SchemaCatalog, TableSchema};
use crate::compiler::{quote_ident, CompiledStatement};
use crate::data_store::{
    DataStoreClient, DataStoreError, ExecutionFault, ExecutionLimits, ResultSet, Row, Value,
};
use crate::query::Literal;
use async_trait::async_trait;
use log::{debug, info, warn};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, ToSql};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// SQLite file opened read-only for every request.
pub struct SqliteDataStore {
    path: PathBuf,
    database_id: String,
}

impl SqliteDataStore {
    pub fn new(path: impl AsRef<Path>, database_id: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            database_id: database_id.into(),
        }
    }

    fn open(&self) -> Result<Connection, rusqlite::Error> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }
}

impl ToSql for Literal {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Literal::Text(text) => ToSqlOutput::from(text.as_str()),
            Literal::Integer(value) => ToSqlOutput::from(*value),
            Literal::Real(value) => ToSqlOutput::from(*value),
            Literal::Boolean(value) => ToSqlOutput::from(*value),
            Literal::Date(date) => ToSqlOutput::from(date.format("%Y-%m-%d").to_string()),
            Literal::Timestamp(ts) => {
                ToSqlOutput::from(ts.format("%Y-%m-%d %H:%M:%S").to_string())
            }
        })
    }
}

#[async_trait]
impl DataStoreClient for SqliteDataStore {
    fn database_id(&self) -> &str {
        &self.database_id
    }

    async fn introspect(&self) -> Result<SchemaCatalog, DataStoreError> {
        let connection = self
            .open()
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;
        let database = self.database_id.clone();

        let catalog = tokio::task::spawn_blocking(move || read_catalog(&connection, database))
            .await
            .map_err(|e| DataStoreError::IntrospectionError(e.to_string()))?
            .map_err(|e| DataStoreError::IntrospectionError(e.to_string()))?;

        info!(
            "Introspected {} tables from {}",
            catalog.len(),
            self.path.display()
        );
        Ok(catalog)
    }

    async fn execute(
        &self,
        statement: &CompiledStatement,
        limits: &ExecutionLimits,
    ) -> Result<ResultSet, ExecutionFault> {
        let connection = self
            .open()
            .map_err(|e| ExecutionFault::Storage(e.to_string()))?;
        let interrupt = connection.get_interrupt_handle();
        let cancelled = Arc::new(AtomicBool::new(false));
        let owned = statement.clone();
        let max_rows = limits.max_rows;

        let task = tokio::task::spawn_blocking({
            let cancelled = Arc::clone(&cancelled);
            move || {
                run_statement(&connection, &owned, max_rows, &cancelled)
                    .map_err(|e| ExecutionFault::Storage(e.to_string()))
            }
        });

        match tokio::time::timeout(limits.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ExecutionFault::Storage(e.to_string())),
            Err(_) => {
                // the flag covers a task that has not started stepping yet
                cancelled.store(true, Ordering::SeqCst);
                interrupt.interrupt();
                warn!(
                    "Interrupted statement after {:?}: {}",
                    limits.timeout, statement.sql
                );
                Err(ExecutionFault::Timeout(limits.timeout))
            }
        }
    }
}

fn run_statement(
    connection: &Connection,
    statement: &CompiledStatement,
    max_rows: usize,
    cancelled: &AtomicBool,
) -> Result<ResultSet, rusqlite::Error> {
    let check_cancelled = || {
        if cancelled.load(Ordering::SeqCst) {
            Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
                Some("statement cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    };

    check_cancelled()?;
    let mut prepared = connection.prepare(&statement.sql)?;
    let columns: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    check_cancelled()?;
    let mut rows = prepared.query(params_from_iter(statement.params.iter()))?;
    let mut collected = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        check_cancelled()?;
        if collected.len() == max_rows {
            truncated = true;
            break;
        }
        let values = (0..columns.len())
            .map(|idx| row.get_ref(idx).map(decode_value))
            .collect::<Result<Vec<_>, _>>()?;
        collected.push(Row {
            columns: columns.clone(),
            values,
        });
    }

    debug!("Fetched {} rows (truncated: {})", collected.len(), truncated);
    Ok(ResultSet {
        columns,
        rows: collected,
        truncated,
    })
}

fn decode_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Int(value),
        ValueRef::Real(value) => Value::Float(value),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn read_catalog(
    connection: &Connection,
    database: String,
) -> Result<SchemaCatalog, rusqlite::Error> {
    let mut tables = connection.prepare(
        "SELECT name FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = tables
        .query_map([], |row| row.get::<usize, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut columns = connection.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;

    let mut builder = SchemaCatalog::builder(database);
    for name in names {
        let table_columns = columns
            .query_map([&name], |row| {
                let mut column = ColumnSchema::new(
                    row.get::<usize, String>(0)?,
                    row.get::<usize, Option<String>>(1)?.unwrap_or_default(),
                );
                if row.get::<usize, i64>(2)? != 0 {
                    column = column.not_null();
                }
                if let Some(default_value) = row.get::<usize, Option<String>>(3)? {
                    column = column.with_default(default_value);
                }
                if row.get::<usize, i64>(4)? > 0 {
                    column = column.primary_key();
                }
                Ok(column)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let row_count: i64 = connection.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&name)),
            [],
            |row| row.get(0),
        )?;
        debug!("Table {} has {} columns", name, table_columns.len());

        builder = builder.table(
            TableSchema::new(name, table_columns).with_row_count(row_count.max(0) as u64),
        );
    }
    Ok(builder.build())
}
