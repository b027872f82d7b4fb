mod column_type;

pub use column_type::ColumnType;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Read-only snapshot of the tables and columns of one database.
///
/// A catalog is built once from introspection and never mutated afterwards;
/// replacing the database means building a new catalog and publishing it
/// through a [`crate::snapshot::SnapshotStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    database: String,
    tables: HashMap<String, TableSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub declared_type: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub default_value: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        let declared_type = declared_type.into();
        let column_type = match ColumnType::from_str(&declared_type) {
            Ok(column_type) => column_type,
            Err(never) => match never {},
        };
        Self {
            name: name.into(),
            declared_type,
            column_type,
            nullable: true,
            primary_key: false,
            default_value: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default_value: impl Into<String>) -> Self {
        self.default_value = Some(default_value.into());
        self
    }
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            row_count: None,
        }
    }

    pub fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = Some(row_count);
        self
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    /// Exact, case-sensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Case-insensitive exact match, used to bind untrusted field terms.
    pub fn column_ignore_case(&self, term: &str) -> Option<&ColumnSchema> {
        let term = term.trim();
        self.column(term).or_else(|| {
            self.columns
                .iter()
                .find(|column| column.name.eq_ignore_ascii_case(term))
        })
    }
}

impl SchemaCatalog {
    pub fn builder(database: impl Into<String>) -> SchemaCatalogBuilder {
        SchemaCatalogBuilder {
            database: database.into(),
            tables: HashMap::new(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnSchema> {
        self.table(table).and_then(|table| table.column(column))
    }

    /// Table names in a stable order.
    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

pub struct SchemaCatalogBuilder {
    database: String,
    tables: HashMap<String, TableSchema>,
}

impl SchemaCatalogBuilder {
    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    pub fn build(self) -> SchemaCatalog {
        SchemaCatalog {
            database: self.database,
            tables: self.tables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::builder("shop")
            .table(TableSchema::new(
                "orders",
                vec![
                    ColumnSchema::new("id", "INTEGER").primary_key(),
                    ColumnSchema::new("Amount", "REAL"),
                    ColumnSchema::new("status", "TEXT").with_default("pending"),
                ],
            ))
            .build()
    }

    #[test]
    fn test_absent_table_is_not_found() {
        let catalog = catalog();
        assert!(catalog.table("customers").is_none());
        assert!(catalog.column("customers", "id").is_none());
    }

    #[test]
    fn test_column_lookup_is_exact_unless_asked() {
        let catalog = catalog();
        assert!(catalog.column("orders", "amount").is_none());

        let orders = catalog.table("orders").unwrap();
        let column = orders.column_ignore_case(" amount ").unwrap();
        assert_eq!(column.name, "Amount");
        assert_eq!(column.column_type, ColumnType::Real);
    }

    #[test]
    fn test_primary_key_implies_not_null() {
        let catalog = catalog();
        let id = catalog.column("orders", "id").unwrap();
        assert!(id.primary_key);
        assert!(!id.nullable);
        assert_eq!(
            catalog.column("orders", "status").unwrap().default_value.as_deref(),
            Some("pending")
        );
    }
}
