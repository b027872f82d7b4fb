use crate::query::{Aggregation, ComparisonOp};
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleSetError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON format: {0}")]
    InvalidJsonFormat(String),

    #[error("Metric '{metric}' declares unsupported aggregation '{aggregation}'")]
    UnsupportedAggregation { metric: String, aggregation: String },

    #[error("Default filter on '{table}.{column}' uses unsupported operator '{operator}'")]
    UnsupportedOperator {
        table: String,
        column: String,
        operator: String,
    },

    #[error("Default filter on '{table}.{column}' needs a scalar value")]
    InvalidFilterValue { table: String, column: String },

    #[error("Empty term in section '{0}'")]
    EmptyTerm(&'static str),
}

/// What a metric term means: one column of one table, with an optional
/// aggregation used when the intent names none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRule {
    pub table: String,
    pub column: String,
    pub aggregation: Option<Aggregation>,
}

/// A predicate applied to every query against a table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefaultFilterRule {
    pub column: String,
    pub operator: ComparisonOp,
    pub value: serde_json::Value,
    pub rationale: Option<String>,
}

/// Inclusivity of resolved time-range bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBoundsPolicy {
    #[serde(default = "default_true")]
    pub lower_inclusive: bool,
    #[serde(default)]
    pub upper_inclusive: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TimeBoundsPolicy {
    fn default() -> Self {
        Self {
            lower_inclusive: true,
            upper_inclusive: false,
        }
    }
}

/// Business vocabulary mapped onto concrete schema elements.
///
/// Terms are stored lowercased and trimmed; lookups normalize the same way.
/// Absent terms are reported as `None`, never defaulted.
#[derive(Debug, Clone, Default)]
pub struct BusinessRuleSet {
    metrics: HashMap<String, MetricRule>,
    entities: HashMap<String, String>,
    default_filters: HashMap<String, Vec<DefaultFilterRule>>,
    time_columns: HashMap<String, String>,
    time_bounds: TimeBoundsPolicy,
    reference_date: Option<NaiveDate>,
}

/// On-disk shape of the rules file.
#[derive(Debug, Deserialize)]
struct RuleSetConfig {
    #[serde(default)]
    metrics: HashMap<String, MetricConfig>,
    #[serde(default)]
    entities: HashMap<String, String>,
    #[serde(default)]
    default_filters: HashMap<String, Vec<DefaultFilterConfig>>,
    #[serde(default)]
    time_columns: HashMap<String, String>,
    #[serde(default)]
    time_bounds: TimeBoundsPolicy,
    #[serde(default)]
    reference_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct MetricConfig {
    table: String,
    column: String,
    #[serde(default)]
    aggregation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DefaultFilterConfig {
    column: String,
    operator: String,
    value: serde_json::Value,
    #[serde(default)]
    rationale: Option<String>,
}

fn sorted_keys<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut terms: Vec<&str> = keys.map(String::as_str).collect();
    terms.sort_unstable();
    terms
}

fn normalize_term(term: &str) -> String {
    term.trim().to_lowercase()
}

impl BusinessRuleSet {
    pub fn builder() -> BusinessRuleSetBuilder {
        BusinessRuleSetBuilder {
            rules: BusinessRuleSet::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuleSetError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|_| RuleSetError::FileNotFound(path.display().to_string()))?;
        let rules = Self::from_json(&json)?;
        info!(
            "Loaded business rules from {}: {} metrics, {} entities",
            path.display(),
            rules.metrics.len(),
            rules.entities.len()
        );
        Ok(rules)
    }

    pub fn from_json(json: &str) -> Result<Self, RuleSetError> {
        let config: RuleSetConfig = serde_json::from_str(json)
            .map_err(|e| RuleSetError::InvalidJsonFormat(e.to_string()))?;

        let mut builder = Self::builder()
            .time_bounds(config.time_bounds)
            .reference_date(config.reference_date);

        // Sorted so that a bad file always reports the same first error
        let mut metrics: Vec<_> = config.metrics.into_iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        for (term, metric) in metrics {
            let aggregation = match metric.aggregation.as_deref() {
                None => None,
                Some(keyword) => Some(Aggregation::parse(keyword).ok_or_else(|| {
                    RuleSetError::UnsupportedAggregation {
                        metric: term.clone(),
                        aggregation: keyword.to_string(),
                    }
                })?),
            };
            builder = builder.metric(&term, &metric.table, &metric.column, aggregation)?;
        }

        for (term, table) in config.entities {
            builder = builder.entity(&term, &table)?;
        }

        let mut default_filters: Vec<_> = config.default_filters.into_iter().collect();
        default_filters.sort_by(|a, b| a.0.cmp(&b.0));
        for (table, filters) in default_filters {
            for filter in filters {
                let operator = ComparisonOp::parse(&filter.operator).ok_or_else(|| {
                    RuleSetError::UnsupportedOperator {
                        table: table.clone(),
                        column: filter.column.clone(),
                        operator: filter.operator.clone(),
                    }
                })?;
                builder = builder.default_filter(
                    &table,
                    DefaultFilterRule {
                        column: filter.column,
                        operator,
                        value: filter.value,
                        rationale: filter.rationale,
                    },
                )?;
            }
        }

        for (table, column) in config.time_columns {
            builder = builder.time_column(&table, &column);
        }

        Ok(builder.build())
    }

    pub fn metric(&self, term: &str) -> Option<&MetricRule> {
        self.metrics.get(&normalize_term(term))
    }

    pub fn entity(&self, term: &str) -> Option<&str> {
        self.entities.get(&normalize_term(term)).map(String::as_str)
    }

    /// Known metric terms, sorted.
    pub fn metric_terms(&self) -> Vec<&str> {
        sorted_keys(self.metrics.keys())
    }

    /// Known entity terms, sorted.
    pub fn entity_terms(&self) -> Vec<&str> {
        sorted_keys(self.entities.keys())
    }

    /// Default filters of a table in declaration order; empty when none are declared.
    pub fn default_filters(&self, table: &str) -> &[DefaultFilterRule] {
        self.default_filters
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn time_column(&self, table: &str) -> Option<&str> {
        self.time_columns.get(table).map(String::as_str)
    }

    pub fn time_bounds(&self) -> TimeBoundsPolicy {
        self.time_bounds
    }

    /// Pinned "today" for relative periods. `None` means the local clock.
    pub fn reference_date(&self) -> Option<NaiveDate> {
        self.reference_date
    }
}

pub struct BusinessRuleSetBuilder {
    rules: BusinessRuleSet,
}

impl BusinessRuleSetBuilder {
    pub fn metric(
        mut self,
        term: &str,
        table: &str,
        column: &str,
        aggregation: Option<Aggregation>,
    ) -> Result<Self, RuleSetError> {
        let term = normalize_term(term);
        if term.is_empty() {
            return Err(RuleSetError::EmptyTerm("metrics"));
        }
        debug!("metric '{}' -> {}.{} ({:?})", term, table, column, aggregation);
        self.rules.metrics.insert(
            term,
            MetricRule {
                table: table.to_string(),
                column: column.to_string(),
                aggregation,
            },
        );
        Ok(self)
    }

    pub fn entity(mut self, term: &str, table: &str) -> Result<Self, RuleSetError> {
        let term = normalize_term(term);
        if term.is_empty() {
            return Err(RuleSetError::EmptyTerm("entities"));
        }
        self.rules.entities.insert(term, table.to_string());
        Ok(self)
    }

    pub fn default_filter(
        mut self,
        table: &str,
        filter: DefaultFilterRule,
    ) -> Result<Self, RuleSetError> {
        if matches!(
            filter.value,
            serde_json::Value::Null | serde_json::Value::Array(_) | serde_json::Value::Object(_)
        ) {
            return Err(RuleSetError::InvalidFilterValue {
                table: table.to_string(),
                column: filter.column,
            });
        }
        self.rules
            .default_filters
            .entry(table.to_string())
            .or_default()
            .push(filter);
        Ok(self)
    }

    pub fn time_column(mut self, table: &str, column: &str) -> Self {
        self.rules
            .time_columns
            .insert(table.to_string(), column.to_string());
        self
    }

    pub fn time_bounds(mut self, policy: TimeBoundsPolicy) -> Self {
        self.rules.time_bounds = policy;
        self
    }

    pub fn reference_date(mut self, date: Option<NaiveDate>) -> Self {
        self.rules.reference_date = date;
        self
    }

    pub fn build(self) -> BusinessRuleSet {
        self.rules
    }
}
