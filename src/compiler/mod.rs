pub mod safety;

pub use safety::{ensure_read_only, UnsafeStatement};

use crate::query::{AggregateTarget, CanonicalQuery, ComparisonOp, Literal, Projection};
use serde::Serialize;

/// Parameterized SQL text plus its bound values, in placeholder order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Literal>,
}

impl CompiledStatement {
    /// Number of `?` placeholders outside quoted identifiers.
    pub fn placeholder_count(&self) -> usize {
        let mut quoted = false;
        let mut count = 0;
        for c in self.sql.chars() {
            match c {
                '"' => quoted = !quoted,
                '?' if !quoted => count += 1,
                _ => {}
            }
        }
        count
    }
}

/// Double-quotes an identifier, doubling any embedded quote.
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Emits SQL for a validated query. Never fails and never inlines a value.
pub fn compile(query: &CanonicalQuery) -> CompiledStatement {
    let projection = match &query.projection {
        Projection::AllColumns => "*".to_string(),
        Projection::Aggregate {
            function,
            target: AggregateTarget::Column(column),
        } => format!("{}({})", function.keyword(), quote_ident(&column.column)),
        Projection::Aggregate {
            function,
            target: AggregateTarget::Rows,
        } => format!("{}(*)", function.keyword()),
    };

    let mut sql = format!("SELECT {} FROM {}", projection, quote_ident(&query.table));
    let mut predicates = Vec::new();
    let mut params = Vec::new();

    let mut bind = |column: &str, operator: ComparisonOp, value: &Literal| {
        predicates.push(format!("{} {} ?", quote_ident(column), operator.symbol()));
        params.push(value.clone());
    };

    for filter in &query.filters {
        bind(&filter.column.column, filter.operator, &filter.value);
    }
    if let Some(range) = &query.time_range {
        bind(&range.column.column, range.lower_operator(), &range.lower);
        bind(&range.column.column, range.upper_operator(), &range.upper);
    }

    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    CompiledStatement { sql, params }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Aggregation, ColumnRef, FilterOrigin, ResolvedFilter, TimeRange};
    use chrono::NaiveDate;
    use rstest::*;

    fn filter(column: &str, operator: ComparisonOp, value: Literal) -> ResolvedFilter {
        ResolvedFilter {
            column: ColumnRef::new("orders", column),
            operator,
            value,
            origin: FilterOrigin::Intent,
        }
    }

    fn query(projection: Projection) -> CanonicalQuery {
        CanonicalQuery {
            table: "orders".to_string(),
            projection,
            filters: vec![],
            time_range: None,
        }
    }

    fn sum_of(column: &str) -> Projection {
        Projection::Aggregate {
            function: Aggregation::Sum,
            target: AggregateTarget::Column(ColumnRef::new("orders", column)),
        }
    }

    #[rstest]
    #[case::listing(Projection::AllColumns, r#"SELECT * FROM "orders""#)]
    #[case::sum(sum_of("amount"), r#"SELECT SUM("amount") FROM "orders""#)]
    #[case::count_rows(
        Projection::Aggregate { function: Aggregation::Count, target: AggregateTarget::Rows },
        r#"SELECT COUNT(*) FROM "orders""#
    )]
    #[case::quoted_identifier(
        sum_of("net \"gross\""),
        r#"SELECT SUM("net ""gross""") FROM "orders""#
    )]
    fn test_projection(#[case] projection: Projection, #[case] expected: &str) {
        let statement = compile(&query(projection));
        assert_eq!(statement.sql, expected);
        assert!(statement.params.is_empty());
    }

    #[test]
    fn test_filters_then_time_bounds() {
        let day = |d| NaiveDate::from_ymd_opt(2025, 1, d).unwrap();
        let mut q = query(sum_of("amount"));
        q.filters = vec![
            filter("status", ComparisonOp::Eq, Literal::Text("completed".into())),
            filter("amount", ComparisonOp::GtEq, Literal::Real(10.0)),
        ];
        q.time_range = Some(TimeRange {
            column: ColumnRef::new("orders", "created_at"),
            lower: Literal::Date(day(1)),
            upper: Literal::Date(day(31)),
            lower_inclusive: true,
            upper_inclusive: true,
            period: "this month".to_string(),
        });

        let statement = compile(&q);
        assert_eq!(
            statement.sql,
            r#"SELECT SUM("amount") FROM "orders" WHERE "status" = ? AND "amount" >= ? AND "created_at" >= ? AND "created_at" <= ?"#
        );
        assert_eq!(
            statement.params,
            vec![
                Literal::Text("completed".into()),
                Literal::Real(10.0),
                Literal::Date(day(1)),
                Literal::Date(day(31)),
            ]
        );
        assert_eq!(statement.placeholder_count(), 4);
        assert!(!statement.sql.contains(';'));
    }

    #[test]
    fn test_hostile_values_stay_out_of_the_text() {
        let mut q = query(Projection::AllColumns);
        q.filters = vec![filter(
            "status",
            ComparisonOp::Eq,
            Literal::Text("x'; DROP TABLE orders; --".into()),
        )];
        let statement = compile(&q);
        assert_eq!(statement.sql, r#"SELECT * FROM "orders" WHERE "status" = ?"#);
        assert_eq!(statement.params.len(), 1);
    }

    #[test]
    fn test_question_mark_inside_identifier_is_not_a_placeholder() {
        let statement = CompiledStatement {
            sql: r#"SELECT * FROM "what?" WHERE "a" = ?"#.to_string(),
            params: vec![Literal::Integer(1)],
        };
        assert_eq!(statement.placeholder_count(), 1);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut q = query(sum_of("amount"));
        q.filters = vec![filter("region", ComparisonOp::NotEq, Literal::Text("US".into()))];
        assert_eq!(compile(&q), compile(&q));
    }
}
