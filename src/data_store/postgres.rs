use crate::catalog::{ColumnSchema, SchemaCatalog, TableSchema};
use crate::compiler::CompiledStatement;
use crate::config::PostgresConfig;
use crate::data_store::{
    DataStoreClient, DataStoreError, ExecutionFault, ExecutionLimits, ResultSet, Row, Value,
};
use crate::query::Literal;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::{pin_mut, TryStreamExt};
use log::{debug, error, info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// One session per store. Statements run one at a time so a timeout can only
/// cancel the statement that timed out.
pub struct PostgresDataStore {
    database_id: String,
    client: Mutex<Client>,
}

impl PostgresDataStore {
    pub async fn new(config: PostgresConfig) -> Result<Self, DataStoreError> {
        let connection_string = format!(
            "postgres://{}:{}@{}/{}",
            config.user, config.password, config.host, config.dbname
        );

        let (client, connection) = tokio_postgres::connect(&connection_string, NoTls)
            .await
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        client
            .batch_execute("SET default_transaction_read_only = on")
            .await
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;

        Ok(PostgresDataStore {
            database_id: config.dbname,
            client: Mutex::new(client),
        })
    }

    async fn fetch(
        client: &Client,
        statement: &CompiledStatement,
        max_rows: usize,
    ) -> Result<ResultSet, tokio_postgres::Error> {
        let prepared = client
            .prepare(&numbered_placeholders(&statement.sql))
            .await?;

        let params = prepared
            .params()
            .iter()
            .zip(&statement.params)
            .map(|(ty, literal)| bind_param(literal, ty))
            .collect::<Option<Vec<_>>>();
        let params = match params {
            Some(params) => params,
            // the server will report the type error itself
            None => statement.params.iter().map(text_param).collect(),
        };
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();

        let stream = client.query_raw(&prepared, refs).await?;
        pin_mut!(stream);

        let mut rows = Vec::new();
        let mut truncated = false;
        while let Some(row) = stream.try_next().await? {
            if rows.len() == max_rows {
                truncated = true;
                break;
            }
            rows.push(decode_row(&row, &columns)?);
        }

        Ok(ResultSet {
            columns,
            rows,
            truncated,
        })
    }
}

#[async_trait]
impl DataStoreClient for PostgresDataStore {
    fn database_id(&self) -> &str {
        &self.database_id
    }

    async fn introspect(&self) -> Result<SchemaCatalog, DataStoreError> {
        let introspection_error = |e: tokio_postgres::Error| {
            DataStoreError::IntrospectionError(e.to_string())
        };

        let client = self.client.lock().await;
        let key_rows = client
            .query(
                "SELECT kcu.table_name, kcu.column_name
                 FROM information_schema.table_constraints tc
                 JOIN information_schema.key_column_usage kcu
                   ON tc.constraint_name = kcu.constraint_name
                  AND tc.table_schema = kcu.table_schema
                 WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = 'public'",
                &[],
            )
            .await
            .map_err(introspection_error)?;
        let primary_keys: HashSet<(String, String)> = key_rows
            .iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect();

        let column_rows = client
            .query(
                "SELECT table_name, column_name, data_type, is_nullable, column_default
                 FROM information_schema.columns
                 WHERE table_schema = 'public'
                 ORDER BY table_name, ordinal_position",
                &[],
            )
            .await
            .map_err(introspection_error)?;

        let mut tables: BTreeMap<String, Vec<ColumnSchema>> = BTreeMap::new();
        for row in column_rows {
            let table: String = row.get(0);
            let name: String = row.get(1);
            let data_type: String = row.get(2);
            let is_nullable: String = row.get(3);
            let default_value: Option<String> = row.get(4);

            let mut column = ColumnSchema::new(name.clone(), data_type);
            if is_nullable == "NO" {
                column = column.not_null();
            }
            if let Some(default_value) = default_value {
                column = column.with_default(default_value);
            }
            if primary_keys.contains(&(table.clone(), name)) {
                column = column.primary_key();
            }
            tables.entry(table).or_default().push(column);
        }

        let catalog = tables
            .into_iter()
            .fold(SchemaCatalog::builder(self.database_id.clone()), |builder, (name, columns)| {
                builder.table(TableSchema::new(name, columns))
            })
            .build();
        info!("Introspected {} tables from {}", catalog.len(), self.database_id);
        Ok(catalog)
    }

    async fn execute(
        &self,
        statement: &CompiledStatement,
        limits: &ExecutionLimits,
    ) -> Result<ResultSet, ExecutionFault> {
        let deadline = Instant::now() + limits.timeout;
        let client = match timeout_at(deadline, self.client.lock()).await {
            Ok(client) => client,
            Err(_) => {
                warn!("Timed out waiting for the session: {}", statement.sql);
                return Err(ExecutionFault::Timeout(limits.timeout));
            }
        };

        match timeout_at(deadline, Self::fetch(&client, statement, limits.max_rows)).await {
            Ok(result) => {
                let result = result.map_err(|e| ExecutionFault::Storage(e.to_string()))?;
                debug!(
                    "Fetched {} rows (truncated: {})",
                    result.rows.len(),
                    result.truncated
                );
                Ok(result)
            }
            Err(_) => {
                // still holding the session, so nothing else can be running on it
                if let Err(e) = client.cancel_token().cancel_query(NoTls).await {
                    error!("Failed to cancel query: {}", e);
                }
                warn!(
                    "Cancelled statement after {:?}: {}",
                    limits.timeout, statement.sql
                );
                Err(ExecutionFault::Timeout(limits.timeout))
            }
        }
    }
}

/// Rewrites `?` placeholders as `$1, $2, ...`, leaving quoted identifiers alone.
fn numbered_placeholders(sql: &str) -> String {
    let mut rewritten = String::with_capacity(sql.len() + 8);
    let mut quoted = false;
    let mut position = 0;
    for c in sql.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                rewritten.push(c);
            }
            '?' if !quoted => {
                position += 1;
                rewritten.push('$');
                rewritten.push_str(&position.to_string());
            }
            _ => rewritten.push(c),
        }
    }
    rewritten
}

/// Converts a literal to the Rust type the server expects for `ty`.
fn bind_param(literal: &Literal, ty: &Type) -> Option<BoxedParam> {
    let param: BoxedParam = match (ty, literal) {
        (&Type::INT2, Literal::Integer(v)) => Box::new(i16::try_from(*v).ok()?),
        (&Type::INT4, Literal::Integer(v)) => Box::new(i32::try_from(*v).ok()?),
        (&Type::INT8, Literal::Integer(v)) => Box::new(*v),
        (&Type::FLOAT4, Literal::Integer(v)) => Box::new(*v as f32),
        (&Type::FLOAT4, Literal::Real(v)) => Box::new(*v as f32),
        (&Type::FLOAT8, Literal::Integer(v)) => Box::new(*v as f64),
        (&Type::FLOAT8, Literal::Real(v)) => Box::new(*v),
        (&Type::NUMERIC, Literal::Integer(v)) => Box::new(Decimal::from(*v)),
        (&Type::NUMERIC, Literal::Real(v)) => Box::new(Decimal::try_from(*v).ok()?),
        (&Type::BOOL, Literal::Boolean(v)) => Box::new(*v),
        (&Type::DATE, Literal::Date(v)) => Box::new(*v),
        (&Type::DATE, Literal::Text(v)) => {
            Box::new(NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok()?)
        }
        (&Type::TIMESTAMP, Literal::Timestamp(v)) => Box::new(*v),
        (&Type::TIMESTAMP, Literal::Date(v)) => Box::new(v.and_time(chrono::NaiveTime::MIN)),
        (&Type::TIMESTAMP, Literal::Text(v)) => Box::new(parse_timestamp(v)?.naive_utc()),
        (&Type::TIMESTAMPTZ, Literal::Timestamp(v)) => Box::new(v.and_utc()),
        (&Type::TIMESTAMPTZ, Literal::Date(v)) => {
            Box::new(v.and_time(chrono::NaiveTime::MIN).and_utc())
        }
        (&Type::TIMESTAMPTZ, Literal::Text(v)) => Box::new(parse_timestamp(v)?),
        (&Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME, literal) => {
            return Some(text_param(literal))
        }
        _ => return None,
    };
    Some(param)
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (or with `T`) and bare dates.
/// Offset-less text is taken as UTC.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(chrono::NaiveTime::MIN))
        })
        .map(|naive| naive.and_utc())
}

fn text_param(literal: &Literal) -> BoxedParam {
    let text = match literal {
        Literal::Text(v) => v.clone(),
        Literal::Integer(v) => v.to_string(),
        Literal::Real(v) => v.to_string(),
        Literal::Boolean(v) => v.to_string(),
        Literal::Date(v) => v.format("%Y-%m-%d").to_string(),
        Literal::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S").to_string(),
    };
    Box::new(text)
}

fn decode_row(row: &tokio_postgres::Row, columns: &[String]) -> Result<Row, tokio_postgres::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_() {
            &Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Boolean),
            &Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)?
                .map(|v| Value::Int(i64::from(v))),
            &Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)?
                .map(|v| Value::Int(i64::from(v))),
            &Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
            &Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)?
                .map(|v| Value::Float(f64::from(v))),
            &Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
            &Type::NUMERIC => row
                .try_get::<_, Option<Decimal>>(idx)?
                .map(|v| v.to_f64().map_or_else(|| Value::String(v.to_string()), Value::Float)),
            &Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME => {
                row.try_get::<_, Option<String>>(idx)?.map(Value::String)
            }
            &Type::DATE => row
                .try_get::<_, Option<NaiveDate>>(idx)?
                .map(|v| Value::String(v.to_string())),
            &Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|v| Value::String(v.to_string())),
            &Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(|v| Value::String(v.to_rfc3339())),
            other => {
                error!("Unexpected type {} in column {}", other, column.name());
                None
            }
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(Row {
        columns: columns.to_vec(),
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"SELECT * FROM "orders""#, r#"SELECT * FROM "orders""#)]
    #[case(
        r#"SELECT SUM("amount") FROM "orders" WHERE "status" = ? AND "created_at" >= ?"#,
        r#"SELECT SUM("amount") FROM "orders" WHERE "status" = $1 AND "created_at" >= $2"#
    )]
    #[case(r#"SELECT * FROM "why?" WHERE "a" = ?"#, r#"SELECT * FROM "why?" WHERE "a" = $1"#)]
    fn test_numbered_placeholders(#[case] sql: &str, #[case] expected: &str) {
        assert_eq!(numbered_placeholders(sql), expected);
    }

    #[rstest]
    #[case(Literal::Integer(7), Type::INT4, true)]
    #[case(Literal::Integer(i64::MAX), Type::INT2, false)]
    #[case(Literal::Real(1.5), Type::NUMERIC, true)]
    #[case(Literal::Text("2025-01-03".into()), Type::DATE, true)]
    #[case(Literal::Text("soon".into()), Type::DATE, false)]
    #[case(Literal::Integer(3), Type::TEXT, true)]
    #[case(Literal::Boolean(true), Type::INT8, false)]
    #[case(Literal::Text("2025-01-01".into()), Type::TIMESTAMP, true)]
    #[case(Literal::Text("2025-01-01 08:30:00".into()), Type::TIMESTAMP, true)]
    #[case(Literal::Text("2025-01-01T08:30:00+02:00".into()), Type::TIMESTAMP, true)]
    #[case(Literal::Text("2025-01-01".into()), Type::TIMESTAMPTZ, true)]
    #[case(Literal::Text("2025-01-01T08:30:00Z".into()), Type::TIMESTAMPTZ, true)]
    #[case(Literal::Text("last tuesday".into()), Type::TIMESTAMPTZ, false)]
    #[case(Literal::Integer(9_007_199_254_740_993), Type::NUMERIC, true)]
    fn test_bind_param(#[case] literal: Literal, #[case] ty: Type, #[case] bindable: bool) {
        assert_eq!(bind_param(&literal, &ty).is_some(), bindable);
    }

    // needs a reachable server configured through POSTGRES_* variables
    #[tokio::test]
    #[ignore]
    async fn test_timeout_leaves_other_statements_alone() {
        let store = PostgresDataStore::new(PostgresConfig::new().unwrap())
            .await
            .unwrap();
        let slow = CompiledStatement {
            sql: "SELECT 1 AS done FROM pg_sleep(1)".to_string(),
            params: vec![],
        };
        let fast = CompiledStatement {
            sql: "SELECT 2 AS done".to_string(),
            params: vec![],
        };
        let patient = ExecutionLimits {
            timeout: std::time::Duration::from_secs(10),
            max_rows: 10,
        };
        let hasty = ExecutionLimits {
            timeout: std::time::Duration::from_millis(200),
            max_rows: 10,
        };

        let (slow_result, fast_result) =
            tokio::join!(store.execute(&slow, &patient), store.execute(&fast, &hasty));

        assert_eq!(slow_result.unwrap().rows[0].values, vec![Value::Int(1)]);
        assert_eq!(
            fast_result.unwrap_err(),
            ExecutionFault::Timeout(std::time::Duration::from_millis(200))
        );
    }

    #[rstest]
    #[case("2025-01-01", "2025-01-01T00:00:00+00:00")]
    #[case("2025-01-01 08:30:00", "2025-01-01T08:30:00+00:00")]
    #[case(" 2025-01-01T08:30:00.5 ", "2025-01-01T08:30:00.500+00:00")]
    #[case("2025-01-01T08:30:00+02:00", "2025-01-01T06:30:00+00:00")]
    fn test_parse_timestamp(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(parse_timestamp(text).unwrap().to_rfc3339(), expected);
    }
}
