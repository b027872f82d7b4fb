use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;

/// Coarse type class of a column, derived from its declared type.
///
/// Declared types come from SQLite (free-form, resolved with the affinity
/// rules) or from Postgres (`udt_name` values such as `int4` or `timestamptz`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Numeric,
    Text,
    Boolean,
    Date,
    Timestamp,
    Blob,
    /// Anything we could not classify, including SQLite columns declared without a type.
    Other,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::Real | ColumnType::Numeric
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::Timestamp)
    }
}

impl FromStr for ColumnType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let declared = s.trim().to_ascii_lowercase();

        let exact = match declared.as_str() {
            "int2" | "int4" | "int8" | "serial" | "bigserial" | "smallserial" => {
                Some(ColumnType::Integer)
            }
            "float4" | "float8" | "double precision" => Some(ColumnType::Real),
            "money" => Some(ColumnType::Numeric),
            "bool" | "boolean" => Some(ColumnType::Boolean),
            "date" => Some(ColumnType::Date),
            "timestamp" | "timestamptz" | "datetime" => Some(ColumnType::Timestamp),
            "bytea" | "blob" => Some(ColumnType::Blob),
            "" | "interval" | "point" => Some(ColumnType::Other),
            _ => None,
        };
        if let Some(column_type) = exact {
            return Ok(column_type);
        }

        // SQLite affinity, checked in the same order SQLite applies it
        let column_type = if declared.contains("int") {
            ColumnType::Integer
        } else if ["char", "clob", "text"]
            .iter()
            .any(|needle| declared.contains(needle))
        {
            ColumnType::Text
        } else if declared.contains("blob") {
            ColumnType::Blob
        } else if ["real", "floa", "doub"]
            .iter()
            .any(|needle| declared.contains(needle))
        {
            ColumnType::Real
        } else if declared.starts_with("timestamp") || declared.contains("datetime") {
            ColumnType::Timestamp
        } else if declared.contains("date") {
            ColumnType::Date
        } else if declared.contains("bool") {
            ColumnType::Boolean
        } else if declared.contains("dec") || declared.contains("num") {
            ColumnType::Numeric
        } else {
            ColumnType::Other
        };
        Ok(column_type)
    }
}
