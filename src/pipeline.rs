//! Question in, [`QueryOutcome`] out.
//!
//! Each request pins one schema snapshot and one rule-set snapshot for its
//! whole life, runs intent → resolve → validate → compile → read-only check →
//! execute, and stops at the first failing stage. Nothing a stage rejected is
//! ever handed to the next one.

use crate::catalog::SchemaCatalog;
use crate::compiler::{compile, ensure_read_only, CompiledStatement, UnsafeStatement};
use crate::config::Config;
use crate::data_store::{
    DataStoreClient, DataStoreError, ExecutionFault, ExecutionLimits, ResultSet, Row,
    DEFAULT_EXECUTION_TIMEOUT, DEFAULT_MAX_ROWS,
};
use crate::intent::{IntentError, SemanticIntent};
use crate::intent_source::IntentSource;
use crate::query::validator::DEFAULT_MAX_FILTERS;
use crate::query::{
    Aggregation, CanonicalQuery, ComparisonOp, IntentResolver, ResolutionError, ValidationError,
    Validator,
};
use crate::rules::{BusinessRuleSet, RuleSetError};
use crate::snapshot::{Snapshot, SnapshotStore};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Intent source failed: {0}")]
    Intent(#[from] IntentError),

    #[error("Intent source did not answer within {0:?}")]
    IntentTimeout(Duration),

    #[error("Unknown database '{0}'")]
    UnknownDatabase(String),

    #[error("Resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unsafe statement: {0}")]
    UnsafeStatement(#[from] UnsafeStatement),

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionFault),
}

impl PipelineError {
    /// Stable machine-readable category for callers.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Intent(_) => "intent",
            PipelineError::IntentTimeout(_) => "intent_timeout",
            PipelineError::UnknownDatabase(_) => "unknown_database",
            PipelineError::Resolution(_) => "resolution",
            PipelineError::Validation(_) => "validation",
            PipelineError::UnsafeStatement(_) => "unsafe_statement",
            PipelineError::Execution(ExecutionFault::Timeout(_)) => "execution_timeout",
            PipelineError::Execution(ExecutionFault::Storage(_)) => "execution",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub intent_timeout: Duration,
    pub execution_timeout: Duration,
    pub max_rows: usize,
    pub max_filters: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            intent_timeout: Duration::from_secs(30),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            max_rows: DEFAULT_MAX_ROWS,
            max_filters: DEFAULT_MAX_FILTERS,
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            intent_timeout: config.intent_timeout(),
            execution_timeout: config.execution_timeout(),
            max_rows: config.max_rows,
            max_filters: config.max_filters,
        }
    }
}

/// A natural-language question, optionally addressed to a specific database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Question {
    pub text: String,
    pub database: Option<String>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            database: None,
        }
    }

    pub fn for_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intent,
    Resolve,
    Validate,
    Compile,
    Safety,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub elapsed_ms: u64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub kind: &'static str,
    pub message: String,
    /// What the caller could have asked for instead, from the pinned snapshots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Everything the pipeline did for one question, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub success: bool,
    pub question: String,
    pub database: String,
    pub intent: Option<SemanticIntent>,
    pub canonical_query: Option<CanonicalQuery>,
    pub statement: Option<CompiledStatement>,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub truncated: bool,
    pub warnings: Vec<String>,
    pub steps: Vec<StageReport>,
    pub catalog_generation: u64,
    pub rules_generation: u64,
    pub error: Option<FailureDetail>,
    pub elapsed_ms: u64,
}

impl QueryOutcome {
    pub fn failed_stage(&self) -> Option<Stage> {
        self.steps
            .iter()
            .find(|step| step.status == StageStatus::Failed)
            .map(|step| step.stage)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Outcome under construction.
struct Run {
    started: Instant,
    outcome: QueryOutcome,
}

impl Run {
    fn new(
        question: &Question,
        catalog: &Snapshot<SchemaCatalog>,
        rules: &Snapshot<BusinessRuleSet>,
    ) -> Self {
        Self {
            started: Instant::now(),
            outcome: QueryOutcome {
                success: false,
                question: question.text.clone(),
                database: catalog.database().to_string(),
                intent: None,
                canonical_query: None,
                statement: None,
                columns: Vec::new(),
                rows: Vec::new(),
                row_count: 0,
                truncated: false,
                warnings: Vec::new(),
                steps: Vec::new(),
                catalog_generation: catalog.generation,
                rules_generation: rules.generation,
                error: None,
                elapsed_ms: 0,
            },
        }
    }

    fn push(
        &mut self,
        stage: Stage,
        started: Instant,
        status: StageStatus,
        detail: Option<String>,
    ) {
        self.outcome.steps.push(StageReport {
            stage,
            status,
            elapsed_ms: elapsed_ms(started),
            detail,
        });
    }

    fn track<T, E: fmt::Display>(
        &mut self,
        stage: Stage,
        started: Instant,
        result: Result<T, E>,
    ) -> Result<T, E> {
        match &result {
            Ok(_) => self.push(stage, started, StageStatus::Ok, None),
            Err(e) => self.push(stage, started, StageStatus::Failed, Some(e.to_string())),
        }
        result
    }

    fn finish(
        mut self,
        result: Result<ResultSet, PipelineError>,
        catalog: &SchemaCatalog,
        rules: &BusinessRuleSet,
    ) -> QueryOutcome {
        match result {
            Ok(result_set) => {
                self.outcome.success = true;
                self.outcome.row_count = result_set.rows.len();
                self.outcome.columns = result_set.columns;
                self.outcome.rows = result_set.rows;
                self.outcome.truncated = result_set.truncated;
            }
            Err(e) => {
                let query = self.outcome.canonical_query.as_ref();
                self.outcome.error = Some(FailureDetail {
                    kind: e.kind(),
                    message: e.to_string(),
                    hint: hint(&e, query, catalog, rules),
                });
            }
        }
        self.outcome.elapsed_ms = elapsed_ms(self.started);
        self.outcome
    }
}

fn available(label: &str, names: &[&str]) -> Option<String> {
    if names.is_empty() {
        None
    } else {
        Some(format!("{}: {}", label, names.join(", ")))
    }
}

fn columns_of(catalog: &SchemaCatalog, table: &str) -> Option<String> {
    let table = catalog.table(table)?;
    available(
        &format!("Available columns in '{}'", table.name),
        &table.column_names(),
    )
}

fn hint(
    error: &PipelineError,
    query: Option<&CanonicalQuery>,
    catalog: &SchemaCatalog,
    rules: &BusinessRuleSet,
) -> Option<String> {
    match error {
        PipelineError::Resolution(ResolutionError::UnknownMetric(_)) => {
            available("Available metrics", &rules.metric_terms())
        }
        PipelineError::Resolution(
            ResolutionError::UnknownEntity(_) | ResolutionError::AmbiguousEntity,
        ) => available("Available entities", &rules.entity_terms()),
        PipelineError::Resolution(ResolutionError::UnknownColumn { table, .. }) => {
            columns_of(catalog, table)
        }
        PipelineError::Resolution(ResolutionError::UnsupportedAggregation(_)) => {
            let keywords: Vec<&str> = Aggregation::ALL.iter().map(|a| a.keyword()).collect();
            available("Supported aggregations", &keywords)
        }
        PipelineError::Resolution(ResolutionError::UnsupportedOperator(_)) => {
            let symbols: Vec<&str> = ComparisonOp::ALL.iter().map(|op| op.symbol()).collect();
            available("Supported operators", &symbols)
        }
        PipelineError::Validation(ValidationError::UnknownTable(_)) => {
            available("Available tables", &catalog.table_names())
        }
        PipelineError::Validation(ValidationError::UnknownColumn(_)) => {
            query.and_then(|query| columns_of(catalog, &query.table))
        }
        PipelineError::UnknownDatabase(_) => {
            Some(format!("Available databases: {}", catalog.database()))
        }
        _ => None,
    }
}

pub struct Pipeline<I, D> {
    intents: I,
    data_store: D,
    catalog: SnapshotStore<SchemaCatalog>,
    rules: SnapshotStore<BusinessRuleSet>,
    settings: PipelineSettings,
}

impl<I, D> Pipeline<I, D>
where
    I: IntentSource,
    D: DataStoreClient,
{
    pub fn new(
        intents: I,
        data_store: D,
        catalog: SchemaCatalog,
        rules: BusinessRuleSet,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            intents,
            data_store,
            catalog: SnapshotStore::new("schema", catalog),
            rules: SnapshotStore::new("rules", rules),
            settings,
        }
    }

    /// Builds a pipeline over a freshly introspected schema.
    pub async fn connect(
        intents: I,
        data_store: D,
        rules: BusinessRuleSet,
        settings: PipelineSettings,
    ) -> Result<Self, DataStoreError> {
        let catalog = data_store.introspect().await?;
        info!(
            "Connected to '{}' with {} tables",
            data_store.database_id(),
            catalog.len()
        );
        Ok(Self::new(intents, data_store, catalog, rules, settings))
    }

    pub fn catalog(&self) -> Arc<Snapshot<SchemaCatalog>> {
        self.catalog.current()
    }

    pub fn rules(&self) -> Arc<Snapshot<BusinessRuleSet>> {
        self.rules.current()
    }

    /// Re-introspects the store; requests already running keep the old schema.
    pub async fn reload_schema(&self) -> Result<u64, DataStoreError> {
        let catalog = self.data_store.introspect().await?;
        Ok(self.catalog.publish(catalog))
    }

    /// Reloads the rules file; a file that fails to load leaves the current rules in place.
    pub fn reload_rules(&self, path: impl AsRef<Path>) -> Result<u64, RuleSetError> {
        let rules = BusinessRuleSet::load(path)?;
        Ok(self.rules.publish(rules))
    }

    pub fn publish_rules(&self, rules: BusinessRuleSet) -> u64 {
        self.rules.publish(rules)
    }

    pub async fn ask(&self, question: &Question) -> QueryOutcome {
        self.process(question, None).await
    }

    /// Runs the pipeline with an intent the caller already has, skipping the intent source.
    pub async fn run_intent(&self, question: &Question, intent: SemanticIntent) -> QueryOutcome {
        self.process(question, Some(intent)).await
    }

    async fn process(&self, question: &Question, supplied: Option<SemanticIntent>) -> QueryOutcome {
        let catalog = self.catalog.current();
        let rules = self.rules.current();
        let mut run = Run::new(question, &catalog, &rules);

        let result = self
            .run_stages(&mut run, question, supplied, &catalog, &rules)
            .await;
        if let Err(e) = &result {
            info!("Question '{}' failed: {}", question.text, e);
        }
        run.finish(result, &catalog, &rules)
    }

    async fn run_stages(
        &self,
        run: &mut Run,
        question: &Question,
        supplied: Option<SemanticIntent>,
        catalog: &SchemaCatalog,
        rules: &BusinessRuleSet,
    ) -> Result<ResultSet, PipelineError> {
        if let Some(database) = &question.database {
            if database != catalog.database() {
                return Err(PipelineError::UnknownDatabase(database.clone()));
            }
        }

        let started = Instant::now();
        let intent = match supplied {
            Some(intent) => {
                run.push(
                    Stage::Intent,
                    started,
                    StageStatus::Skipped,
                    Some("supplied by caller".to_string()),
                );
                intent
            }
            None => {
                let interpreted = match tokio::time::timeout(
                    self.settings.intent_timeout,
                    self.intents.interpret(&question.text, catalog),
                )
                .await
                {
                    Ok(result) => result.map_err(PipelineError::from),
                    Err(_) => Err(PipelineError::IntentTimeout(self.settings.intent_timeout)),
                };
                run.track(Stage::Intent, started, interpreted)?
            }
        };
        debug!("Semantic intent: {:?}", intent);
        run.outcome.intent = Some(intent.clone());

        let started = Instant::now();
        let query = run.track(
            Stage::Resolve,
            started,
            IntentResolver::new(rules, catalog).resolve(&intent),
        )?;
        run.outcome.canonical_query = Some(query.clone());

        let started = Instant::now();
        let validator = Validator::default().with_max_filters(self.settings.max_filters);
        let validated = validator.validate(query.clone(), catalog);
        if let Err(e) = &validated {
            warn!(
                "Rejected query ({}): {}",
                e,
                serde_json::to_string(&query).unwrap_or_default()
            );
        }
        let query = run.track(Stage::Validate, started, validated)?;
        run.outcome.warnings = validator.warnings(&query);

        let started = Instant::now();
        let statement = compile(&query);
        run.push(Stage::Compile, started, StageStatus::Ok, None);
        debug!("Compiled statement: {} {:?}", statement.sql, statement.params);
        run.outcome.statement = Some(statement.clone());

        let started = Instant::now();
        run.track(Stage::Safety, started, ensure_read_only(&statement))?;

        let started = Instant::now();
        let limits = ExecutionLimits {
            timeout: self.settings.execution_timeout,
            max_rows: self.settings.max_rows,
        };
        let executed = self.data_store.execute(&statement, &limits).await;
        if let Err(e) = &executed {
            error!("Execution of '{}' failed: {}", statement.sql, e);
        }
        let result_set = run.track(Stage::Execute, started, executed)?;
        info!(
            "Answered '{}' with {} rows in {} ms",
            question.text,
            result_set.rows.len(),
            elapsed_ms(run.started)
        );
        Ok(result_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnSchema, TableSchema};
    use envconfig::Envconfig;
    use std::collections::HashMap;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PipelineError::from(ResolutionError::AmbiguousEntity).kind(),
            "resolution"
        );
        assert_eq!(
            PipelineError::from(ExecutionFault::Timeout(Duration::from_secs(1))).kind(),
            "execution_timeout"
        );
        assert_eq!(
            PipelineError::UnknownDatabase("x".into()).to_string(),
            "Unknown database 'x'"
        );
    }

    #[test]
    fn test_failure_hints() {
        let catalog = SchemaCatalog::builder("shop")
            .table(TableSchema::new(
                "orders",
                vec![ColumnSchema::new("id", "INTEGER"), ColumnSchema::new("amount", "REAL")],
            ))
            .table(TableSchema::new("customers", vec![ColumnSchema::new("id", "INTEGER")]))
            .build();
        let rules = BusinessRuleSet::builder()
            .metric("revenue", "orders", "amount", None)
            .unwrap()
            .entity("orders", "orders")
            .unwrap()
            .entity("customers", "customers")
            .unwrap()
            .build();
        let hint_for = |error: PipelineError| hint(&error, None, &catalog, &rules);

        assert_eq!(
            hint_for(ResolutionError::UnknownMetric("profit".into()).into()).as_deref(),
            Some("Available metrics: revenue")
        );
        assert_eq!(
            hint_for(ResolutionError::UnknownEntity("invoices".into()).into()).as_deref(),
            Some("Available entities: customers, orders")
        );
        assert_eq!(
            hint_for(
                ResolutionError::UnknownColumn {
                    table: "orders".into(),
                    column: "discount".into(),
                }
                .into()
            )
            .as_deref(),
            Some("Available columns in 'orders': id, amount")
        );
        assert_eq!(
            hint_for(ResolutionError::UnsupportedAggregation("MAX".into()).into()).as_deref(),
            Some("Supported aggregations: SUM, COUNT, AVG")
        );
        assert_eq!(
            hint_for(ValidationError::UnknownTable("invoices".into()).into()).as_deref(),
            Some("Available tables: customers, orders")
        );
        assert_eq!(hint_for(ExecutionFault::Storage("disk".into()).into()), None);
    }

    #[test]
    fn test_settings_from_config() {
        let vars = HashMap::from([("MAX_FILTERS".to_string(), "3".to_string())]);
        let config = Config::init_from_hashmap(&vars).unwrap();
        let settings = PipelineSettings::from(&config);
        assert_eq!(settings.max_filters, 3);
        assert_eq!(settings.max_rows, PipelineSettings::default().max_rows);
    }
}
