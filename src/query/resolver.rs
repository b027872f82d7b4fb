use super::time_range::resolve_bounds;
use super::{
    AggregateTarget, Aggregation, CanonicalQuery, ColumnRef, ComparisonOp, FilterOrigin, Literal,
    Projection, ResolvedFilter, TimeRange,
};
use crate::catalog::{ColumnType, SchemaCatalog};
use crate::intent::{Hint, RawFilter, SemanticIntent};
use crate::rules::{BusinessRuleSet, MetricRule};
use chrono::{Local, NaiveDate};
use log::debug;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("Cannot tell which table the question is about: no entity and no metric given")]
    AmbiguousEntity,

    #[error("Unknown column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("Unsupported operator '{0}'")]
    UnsupportedOperator(String),

    #[error("Unsupported aggregation '{0}'")]
    UnsupportedAggregation(String),

    #[error("Cannot resolve time range '{period}' on table '{table}'")]
    NoTimeColumn { table: String, period: String },

    #[error("Aggregation {0} needs a metric")]
    MissingMetric(Aggregation),

    #[error("Metric '{metric}' belongs to table '{metric_table}', not '{entity_table}'")]
    MetricEntityMismatch {
        metric: String,
        metric_table: String,
        entity_table: String,
    },

    #[error("Filter on '{0}' needs a single scalar value")]
    InvalidFilterValue(String),
}

/// Binds an untrusted [`SemanticIntent`] to one schema and one rule set.
pub struct IntentResolver<'a> {
    rules: &'a BusinessRuleSet,
    schema: &'a SchemaCatalog,
    today: NaiveDate,
}

/// Resolves with the rule set's pinned reference date, or today's local date.
pub fn resolve(
    intent: &SemanticIntent,
    rules: &BusinessRuleSet,
    schema: &SchemaCatalog,
) -> Result<CanonicalQuery, ResolutionError> {
    IntentResolver::new(rules, schema).resolve(intent)
}

impl<'a> IntentResolver<'a> {
    pub fn new(rules: &'a BusinessRuleSet, schema: &'a SchemaCatalog) -> Self {
        let today = rules
            .reference_date()
            .unwrap_or_else(|| Local::now().date_naive());
        Self {
            rules,
            schema,
            today,
        }
    }

    pub fn with_reference_date(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn resolve(&self, intent: &SemanticIntent) -> Result<CanonicalQuery, ResolutionError> {
        let metric = self.resolve_metric(&intent.metric)?;
        let table = self.resolve_table(&intent.entity, metric)?;
        let aggregation = self.resolve_aggregation(intent)?;
        let metric = metric.map(|(_, rule)| rule);
        let projection = self.resolve_projection(&table, metric, aggregation)?;

        // default filters, then the intent's own, then the time range
        let mut filters = self.default_filters(&table);
        for raw in &intent.filters {
            filters.push(self.resolve_filter(&table, raw)?);
        }
        let time_range = match &intent.time_range {
            Hint::Absent => None,
            period => Some(self.resolve_time_range(&table, &period.describe())?),
        };

        let query = CanonicalQuery {
            table,
            projection,
            filters,
            time_range,
        };
        debug!("Resolved canonical query: {:?}", query);
        Ok(query)
    }

    fn resolve_aggregation(
        &self,
        intent: &SemanticIntent,
    ) -> Result<Option<Aggregation>, ResolutionError> {
        match &intent.aggregation {
            Hint::Given(keyword) => Aggregation::parse(keyword)
                .map(Some)
                .ok_or_else(|| ResolutionError::UnsupportedAggregation(keyword.clone())),
            Hint::Malformed(raw) => Err(ResolutionError::UnsupportedAggregation(raw.to_string())),
            // "how many" questions often come back as a count intent with no keyword
            Hint::Absent => match intent.kind.as_given() {
                Some(kind) if kind.eq_ignore_ascii_case("count") && intent.metric.is_absent() => {
                    Ok(Some(Aggregation::Count))
                }
                _ => Ok(None),
            },
        }
    }

    fn resolve_metric<'t>(
        &self,
        metric: &'t Hint<String>,
    ) -> Result<Option<(&'t str, &'a MetricRule)>, ResolutionError> {
        match metric {
            Hint::Absent => Ok(None),
            Hint::Given(term) => self
                .rules
                .metric(term)
                .map(|rule| Some((term.as_str(), rule)))
                .ok_or_else(|| ResolutionError::UnknownMetric(term.clone())),
            Hint::Malformed(raw) => Err(ResolutionError::UnknownMetric(raw.to_string())),
        }
    }

    fn resolve_table(
        &self,
        entity: &Hint<String>,
        metric: Option<(&str, &MetricRule)>,
    ) -> Result<String, ResolutionError> {
        match (entity, metric) {
            (Hint::Given(term), metric) => {
                let table = self
                    .rules
                    .entity(term)
                    .ok_or_else(|| ResolutionError::UnknownEntity(term.clone()))?;
                match metric {
                    Some((term, metric)) if metric.table != table => {
                        Err(ResolutionError::MetricEntityMismatch {
                            metric: term.to_string(),
                            metric_table: metric.table.clone(),
                            entity_table: table.to_string(),
                        })
                    }
                    _ => Ok(table.to_string()),
                }
            }
            (Hint::Malformed(raw), _) => Err(ResolutionError::UnknownEntity(raw.to_string())),
            (Hint::Absent, Some((_, metric))) => Ok(metric.table.clone()),
            (Hint::Absent, None) => Err(ResolutionError::AmbiguousEntity),
        }
    }

    fn resolve_projection(
        &self,
        table: &str,
        metric: Option<&MetricRule>,
        aggregation: Option<Aggregation>,
    ) -> Result<Projection, ResolutionError> {
        let projection = match (metric, aggregation) {
            (Some(metric), aggregation) => match aggregation.or(metric.aggregation) {
                Some(function) => Projection::Aggregate {
                    function,
                    target: AggregateTarget::Column(ColumnRef::new(table, &metric.column)),
                },
                None => Projection::AllColumns,
            },
            (None, Some(Aggregation::Count)) => Projection::Aggregate {
                function: Aggregation::Count,
                target: AggregateTarget::Rows,
            },
            (None, Some(function)) => return Err(ResolutionError::MissingMetric(function)),
            (None, None) => Projection::AllColumns,
        };
        Ok(projection)
    }

    fn column_type(&self, table: &str, column: &str) -> ColumnType {
        self.schema
            .column(table, column)
            .map(|column| column.column_type.clone())
            .unwrap_or(ColumnType::Other)
    }

    fn default_filters(&self, table: &str) -> Vec<ResolvedFilter> {
        self.rules
            .default_filters(table)
            .iter()
            .filter_map(|rule| {
                let column_type = self.column_type(table, &rule.column);
                // scalar-ness was checked when the rules were loaded
                let value = Literal::from_json(&rule.value, &column_type)?;
                Some(ResolvedFilter {
                    column: ColumnRef::new(table, &rule.column),
                    operator: rule.operator,
                    value,
                    origin: FilterOrigin::Default {
                        rationale: rule.rationale.clone(),
                    },
                })
            })
            .collect()
    }

    fn resolve_filter(
        &self,
        table: &str,
        raw: &RawFilter,
    ) -> Result<ResolvedFilter, ResolutionError> {
        let term = match &raw.field {
            Hint::Given(term) => term,
            other => {
                return Err(ResolutionError::UnknownColumn {
                    table: table.to_string(),
                    column: other.describe(),
                })
            }
        };
        let column = self
            .schema
            .table(table)
            .and_then(|schema| schema.column_ignore_case(term))
            .ok_or_else(|| ResolutionError::UnknownColumn {
                table: table.to_string(),
                column: term.clone(),
            })?;

        let operator = match &raw.operator {
            Hint::Given(symbol) => ComparisonOp::parse(symbol)
                .ok_or_else(|| ResolutionError::UnsupportedOperator(symbol.clone()))?,
            other => return Err(ResolutionError::UnsupportedOperator(other.describe())),
        };

        let value = Literal::from_json(&raw.value, &column.column_type)
            .ok_or_else(|| ResolutionError::InvalidFilterValue(column.name.clone()))?;

        Ok(ResolvedFilter {
            column: ColumnRef::new(table, &column.name),
            operator,
            value,
            origin: FilterOrigin::Intent,
        })
    }

    fn resolve_time_range(&self, table: &str, period: &str) -> Result<TimeRange, ResolutionError> {
        let no_time_column = || ResolutionError::NoTimeColumn {
            table: table.to_string(),
            period: period.to_string(),
        };

        let column = self.rules.time_column(table).ok_or_else(no_time_column)?;
        let policy = self.rules.time_bounds();
        let column_type = self.column_type(table, column);
        let (lower, upper) =
            resolve_bounds(period, self.today, &column_type, policy).ok_or_else(no_time_column)?;

        Ok(TimeRange {
            column: ColumnRef::new(table, column),
            lower,
            upper,
            lower_inclusive: policy.lower_inclusive,
            upper_inclusive: policy.upper_inclusive,
            period: period.to_string(),
        })
    }
}
