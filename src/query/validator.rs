use super::{AggregateTarget, CanonicalQuery, ColumnRef, Literal, Projection};
use crate::catalog::{ColumnSchema, ColumnType, SchemaCatalog, TableSchema};
use thiserror::Error;

pub const DEFAULT_MAX_FILTERS: usize = 10;
/// Longest text literal a filter may carry, in characters.
pub const MAX_TEXT_LENGTH: usize = 1000;
const FILTER_WARNING_THRESHOLD: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("Type mismatch on '{column}': {reason}")]
    TypeMismatch { column: String, reason: String },

    #[error("Unsupported construct: {0}")]
    UnsupportedConstruct(String),

    #[error("Access to system table '{0}' is not allowed")]
    RestrictedTable(String),

    #[error("Too many filters: {count} (limit {limit})")]
    TooManyFilters { count: usize, limit: usize },

    #[error("Empty value in filter on '{0}'")]
    EmptyValue(String),

    #[error("Value in filter on '{column}' is {length} characters long (limit {limit})")]
    ValueTooLong {
        column: String,
        length: usize,
        limit: usize,
    },

    #[error("Time range on '{0}' starts after it ends")]
    InvalidTimeRange(String),
}

/// Checks a [`CanonicalQuery`] against the schema before anything is compiled.
///
/// Pure: the result depends only on the query, the schema and the limits.
#[derive(Debug, Clone)]
pub struct Validator {
    max_filters: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            max_filters: DEFAULT_MAX_FILTERS,
        }
    }
}

pub fn validate(
    query: CanonicalQuery,
    schema: &SchemaCatalog,
) -> Result<CanonicalQuery, ValidationError> {
    Validator::default().validate(query, schema)
}

impl Validator {
    pub fn with_max_filters(mut self, max_filters: usize) -> Self {
        self.max_filters = max_filters;
        self
    }

    pub fn validate(
        &self,
        query: CanonicalQuery,
        schema: &SchemaCatalog,
    ) -> Result<CanonicalQuery, ValidationError> {
        if query.table.to_lowercase().starts_with("sqlite_") {
            return Err(ValidationError::RestrictedTable(query.table));
        }
        let table = schema
            .table(&query.table)
            .ok_or_else(|| ValidationError::UnknownTable(query.table.clone()))?;

        if query.filters.len() > self.max_filters {
            return Err(ValidationError::TooManyFilters {
                count: query.filters.len(),
                limit: self.max_filters,
            });
        }

        for column in query.column_refs() {
            lookup(table, column)?;
        }

        if let Projection::Aggregate {
            function,
            target: AggregateTarget::Column(column),
        } = &query.projection
        {
            let schema_column = lookup(table, column)?;
            if function.requires_numeric() && !is_numeric_or_unknown(&schema_column.column_type) {
                return Err(ValidationError::TypeMismatch {
                    column: column.to_string(),
                    reason: format!(
                        "{} needs a numeric column, found {}",
                        function, schema_column.declared_type
                    ),
                });
            }
        }

        for filter in &query.filters {
            let schema_column = lookup(table, &filter.column)?;
            if let Literal::Text(text) = &filter.value {
                if text.trim().is_empty() {
                    return Err(ValidationError::EmptyValue(filter.column.to_string()));
                }
                let length = text.chars().count();
                if length > MAX_TEXT_LENGTH {
                    return Err(ValidationError::ValueTooLong {
                        column: filter.column.to_string(),
                        length,
                        limit: MAX_TEXT_LENGTH,
                    });
                }
            }
            if !filter.value.is_compatible_with(&schema_column.column_type) {
                return Err(ValidationError::TypeMismatch {
                    column: filter.column.to_string(),
                    reason: format!(
                        "{} value compared with {} column",
                        filter.value.kind(),
                        schema_column.declared_type
                    ),
                });
            }
        }

        if let Some(range) = &query.time_range {
            let schema_column = lookup(table, &range.column)?;
            let column_type = &schema_column.column_type;
            if !(column_type.is_temporal()
                || matches!(column_type, ColumnType::Text | ColumnType::Other))
            {
                return Err(ValidationError::TypeMismatch {
                    column: range.column.to_string(),
                    reason: format!(
                        "time range needs a date or timestamp column, found {}",
                        schema_column.declared_type
                    ),
                });
            }
            if !precedes(&range.lower, &range.upper) {
                return Err(ValidationError::InvalidTimeRange(range.column.to_string()));
            }
        }

        Ok(query)
    }

    /// Non-fatal observations about an already valid query.
    pub fn warnings(&self, query: &CanonicalQuery) -> Vec<String> {
        let mut warnings = Vec::new();
        if query.filters.len() > FILTER_WARNING_THRESHOLD {
            warnings.push(format!(
                "Query has {} filters, results may be overly narrow",
                query.filters.len()
            ));
        }
        if !query.is_aggregate() && query.filters.is_empty() && query.time_range.is_none() {
            warnings.push(format!(
                "Unfiltered listing of '{}', results may be truncated",
                query.table
            ));
        }
        warnings
    }
}

fn lookup<'t>(
    table: &'t TableSchema,
    column: &ColumnRef,
) -> Result<&'t ColumnSchema, ValidationError> {
    if column.table != table.name {
        return Err(ValidationError::UnsupportedConstruct(format!(
            "column {} does not belong to table '{}'",
            column, table.name
        )));
    }
    table
        .column(&column.column)
        .ok_or_else(|| ValidationError::UnknownColumn(column.to_string()))
}

fn is_numeric_or_unknown(column_type: &ColumnType) -> bool {
    column_type.is_numeric() || matches!(column_type, ColumnType::Other)
}

fn precedes(lower: &Literal, upper: &Literal) -> bool {
    match (lower, upper) {
        (Literal::Date(lower), Literal::Date(upper)) => lower < upper,
        (Literal::Timestamp(lower), Literal::Timestamp(upper)) => lower < upper,
        _ => false,
    }
}
