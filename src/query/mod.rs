pub mod resolver;
pub mod time_range;
pub mod validator;

pub use resolver::{resolve, IntentResolver, ResolutionError};
pub use validator::{validate, ValidationError, Validator};

use crate::catalog::ColumnType;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three aggregation functions the grammar supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
}

impl Aggregation {
    pub const ALL: [Aggregation; 3] = [Aggregation::Sum, Aggregation::Count, Aggregation::Avg];

    /// Case-insensitive keyword lookup. Anything outside the whitelist is `None`.
    pub fn parse(keyword: &str) -> Option<Self> {
        match keyword.trim().to_ascii_uppercase().as_str() {
            "SUM" => Some(Aggregation::Sum),
            "COUNT" => Some(Aggregation::Count),
            "AVG" => Some(Aggregation::Avg),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Aggregation::Sum => "SUM",
            Aggregation::Count => "COUNT",
            Aggregation::Avg => "AVG",
        }
    }

    pub fn requires_numeric(&self) -> bool {
        matches!(self, Aggregation::Sum | Aggregation::Avg)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    GtEq,
}

impl ComparisonOp {
    pub const ALL: [ComparisonOp; 6] = [
        ComparisonOp::Eq,
        ComparisonOp::NotEq,
        ComparisonOp::Lt,
        ComparisonOp::LtEq,
        ComparisonOp::Gt,
        ComparisonOp::GtEq,
    ];

    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            "=" => Some(ComparisonOp::Eq),
            "!=" => Some(ComparisonOp::NotEq),
            "<" => Some(ComparisonOp::Lt),
            "<=" => Some(ComparisonOp::LtEq),
            ">" => Some(ComparisonOp::Gt),
            ">=" => Some(ComparisonOp::GtEq),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
        }
    }
}

/// A typed value bound to a placeholder. There is no null.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Literal {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Literal {
    /// Types an untrusted JSON scalar against the column it is compared with.
    ///
    /// Returns `None` for null, arrays and objects. Values that do not fit the
    /// column are kept in their natural form so the validator can report the
    /// mismatch.
    pub fn from_json(value: &serde_json::Value, column_type: &ColumnType) -> Option<Literal> {
        use serde_json::Value;

        match value {
            Value::String(text) => Some(Self::from_text(text, column_type)),
            Value::Number(number) => {
                if matches!(column_type, ColumnType::Text) {
                    return Some(Literal::Text(number.to_string()));
                }
                match (number.as_i64(), column_type) {
                    (Some(integer), ColumnType::Real) => Some(Literal::Real(integer as f64)),
                    (Some(integer), _) => Some(Literal::Integer(integer)),
                    (None, _) => number.as_f64().map(Literal::Real),
                }
            }
            Value::Bool(flag) => match column_type {
                ColumnType::Text => Some(Literal::Text(flag.to_string())),
                _ => Some(Literal::Boolean(*flag)),
            },
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    fn from_text(text: &str, column_type: &ColumnType) -> Literal {
        let trimmed = text.trim();
        let typed = match column_type {
            ColumnType::Integer => trimmed.parse::<i64>().ok().map(Literal::Integer),
            ColumnType::Real => trimmed.parse::<f64>().ok().map(Literal::Real),
            // exact integers stay exact for decimal columns
            ColumnType::Numeric => trimmed
                .parse::<i64>()
                .map(Literal::Integer)
                .or_else(|_| trimmed.parse::<f64>().map(Literal::Real))
                .ok(),
            ColumnType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Some(Literal::Boolean(true)),
                "false" => Some(Literal::Boolean(false)),
                _ => None,
            },
            _ => None,
        };
        typed.unwrap_or_else(|| Literal::Text(text.to_string()))
    }

    /// Whether this literal may be compared with a column of the given type.
    pub fn is_compatible_with(&self, column_type: &ColumnType) -> bool {
        match (self, column_type) {
            (_, ColumnType::Other) => true,
            (Literal::Integer(_) | Literal::Real(_), ty) => ty.is_numeric(),
            (Literal::Boolean(_), ColumnType::Boolean | ColumnType::Integer) => true,
            (Literal::Text(_), ColumnType::Text | ColumnType::Date | ColumnType::Timestamp) => {
                true
            }
            (Literal::Date(_) | Literal::Timestamp(_), ty) => {
                ty.is_temporal() || matches!(ty, ColumnType::Text)
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Literal::Text(_) => "text",
            Literal::Integer(_) => "integer",
            Literal::Real(_) => "real",
            Literal::Boolean(_) => "boolean",
            Literal::Date(_) => "date",
            Literal::Timestamp(_) => "timestamp",
        }
    }
}

/// A column qualified by the table it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateTarget {
    Column(ColumnRef),
    /// `COUNT(*)`
    Rows,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Projection {
    AllColumns,
    Aggregate {
        function: Aggregation,
        target: AggregateTarget,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FilterOrigin {
    /// Standing business constraint from the rule set.
    Default { rationale: Option<String> },
    Intent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedFilter {
    pub column: ColumnRef,
    pub operator: ComparisonOp,
    pub value: Literal,
    pub origin: FilterOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRange {
    pub column: ColumnRef,
    pub lower: Literal,
    pub upper: Literal,
    pub lower_inclusive: bool,
    pub upper_inclusive: bool,
    /// The description this range was resolved from, kept for transparency.
    pub period: String,
}

impl TimeRange {
    pub fn lower_operator(&self) -> ComparisonOp {
        if self.lower_inclusive {
            ComparisonOp::GtEq
        } else {
            ComparisonOp::Gt
        }
    }

    pub fn upper_operator(&self) -> ComparisonOp {
        if self.upper_inclusive {
            ComparisonOp::LtEq
        } else {
            ComparisonOp::Lt
        }
    }
}

/// Fully resolved, schema-bound query over exactly one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalQuery {
    pub table: String,
    pub projection: Projection,
    pub filters: Vec<ResolvedFilter>,
    pub time_range: Option<TimeRange>,
}

impl CanonicalQuery {
    /// Scalar aggregate as opposed to a row listing.
    pub fn is_aggregate(&self) -> bool {
        matches!(self.projection, Projection::Aggregate { .. })
    }

    /// Every column the query touches, in emission order.
    pub fn column_refs(&self) -> impl Iterator<Item = &ColumnRef> {
        let projected = match &self.projection {
            Projection::Aggregate {
                target: AggregateTarget::Column(column),
                ..
            } => Some(column),
            _ => None,
        };
        projected
            .into_iter()
            .chain(self.filters.iter().map(|filter| &filter.column))
            .chain(self.time_range.iter().map(|range| &range.column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("sum", Some(Aggregation::Sum))]
    #[case(" Count ", Some(Aggregation::Count))]
    #[case("AVG", Some(Aggregation::Avg))]
    #[case("max", None)]
    #[case("count distinct", None)]
    fn test_aggregation_whitelist(#[case] keyword: &str, #[case] expected: Option<Aggregation>) {
        assert_eq!(Aggregation::parse(keyword), expected);
    }

    #[rstest]
    #[case("=", Some(ComparisonOp::Eq))]
    #[case(">=", Some(ComparisonOp::GtEq))]
    #[case("!=", Some(ComparisonOp::NotEq))]
    #[case("<>", None)]
    #[case("LIKE", None)]
    #[case("; DROP", None)]
    fn test_operator_whitelist(#[case] symbol: &str, #[case] expected: Option<ComparisonOp>) {
        assert_eq!(ComparisonOp::parse(symbol), expected);
    }

    #[rstest]
    #[case(json!("100"), ColumnType::Integer, Some(Literal::Integer(100)))]
    #[case(json!("12.5"), ColumnType::Real, Some(Literal::Real(12.5)))]
    #[case(json!(3), ColumnType::Real, Some(Literal::Real(3.0)))]
    #[case(
        json!(9_007_199_254_740_993i64),
        ColumnType::Numeric,
        Some(Literal::Integer(9_007_199_254_740_993))
    )]
    #[case(
        json!("9007199254740993"),
        ColumnType::Numeric,
        Some(Literal::Integer(9_007_199_254_740_993))
    )]
    #[case(json!("12.25"), ColumnType::Numeric, Some(Literal::Real(12.25)))]
    #[case(json!(7), ColumnType::Text, Some(Literal::Text("7".to_string())))]
    #[case(json!("TRUE"), ColumnType::Boolean, Some(Literal::Boolean(true)))]
    #[case(json!("abc"), ColumnType::Integer, Some(Literal::Text("abc".to_string())))]
    #[case(json!(null), ColumnType::Text, None)]
    #[case(json!(["a"]), ColumnType::Text, None)]
    fn test_literal_typing(
        #[case] value: serde_json::Value,
        #[case] column_type: ColumnType,
        #[case] expected: Option<Literal>,
    ) {
        assert_eq!(Literal::from_json(&value, &column_type), expected);
    }

    #[test]
    fn test_literal_compatibility() {
        assert!(Literal::Integer(1).is_compatible_with(&ColumnType::Real));
        assert!(!Literal::Text("x".into()).is_compatible_with(&ColumnType::Integer));
        assert!(Literal::Text("2025-01-01".into()).is_compatible_with(&ColumnType::Date));
        assert!(Literal::Boolean(true).is_compatible_with(&ColumnType::Other));
        assert!(!Literal::Real(1.0).is_compatible_with(&ColumnType::Boolean));
    }
}
