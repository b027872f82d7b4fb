use crate::catalog::SchemaCatalog;
use crate::data_store::{DataStoreClient, SqliteDataStore, Value};
use crate::intent::{IntentError, SemanticIntent};
use crate::intent_source::{IntentSource, StaticIntentSource};
use crate::pipeline::{Pipeline, PipelineSettings, Question, Stage, StageStatus};
use crate::query::{Literal, Projection};
use crate::rules::BusinessRuleSet;
use async_trait::async_trait;
use chrono::NaiveDate;
use rstest::rstest;
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

const RULES_WITH_DEFAULTS: &str = r#"
{
    "metrics": {
        "revenue": { "table": "orders", "column": "amount", "aggregation": "SUM" },
        "amount": { "table": "orders", "column": "amount" },
        "region total": { "table": "orders", "column": "region", "aggregation": "SUM" }
    },
    "entities": { "orders": "orders", "order": "orders", "customers": "customers" },
    "default_filters": {
        "orders": [
            { "column": "status", "operator": "=", "value": "completed", "rationale": "cancelled orders are not revenue" }
        ]
    },
    "time_columns": { "orders": "created_at" },
    "reference_date": "2025-01-15"
}"#;

const RULES_WITHOUT_DEFAULTS: &str = r#"
{
    "metrics": {
        "revenue": { "table": "orders", "column": "amount", "aggregation": "SUM" }
    },
    "entities": { "orders": "orders" },
    "time_columns": { "orders": "created_at" },
    "reference_date": "2025-01-15"
}"#;

fn seed_database(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("shop.db");
    let connection = Connection::open(&path).unwrap();
    connection
        .execute_batch(
            "CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                amount REAL NOT NULL,
                quantity INTEGER,
                status TEXT NOT NULL,
                region TEXT,
                created_at TIMESTAMP
             );
             CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO orders (amount, quantity, status, region, created_at) VALUES
                (100.0, 1, 'completed', 'EU', '2025-01-05 10:00:00'),
                (50.0, 2, 'completed', 'US', '2025-01-14 09:00:00'),
                (30.0, 1, 'cancelled', 'EU', '2025-01-10 12:00:00'),
                (200.0, 4, 'completed', 'EU', '2024-12-20 08:00:00'),
                (20.0, 1, 'completed', 'US', '2025-02-01 00:00:00');
             INSERT INTO customers (name) VALUES ('Ada'), ('Grace');",
        )
        .unwrap();
    path
}

async fn pipeline_with<I: IntentSource>(
    dir: &TempDir,
    intents: I,
    rules: &str,
    settings: PipelineSettings,
) -> Pipeline<I, SqliteDataStore> {
    let store = SqliteDataStore::new(seed_database(dir), "shop");
    let rules = BusinessRuleSet::from_json(rules).unwrap();
    Pipeline::connect(intents, store, rules, settings).await.unwrap()
}

async fn pipeline(dir: &TempDir, rules: &str) -> Pipeline<StaticIntentSource, SqliteDataStore> {
    pipeline_with(
        dir,
        StaticIntentSource::new(SemanticIntent::default()),
        rules,
        PipelineSettings::default(),
    )
    .await
}

fn midnight(y: i32, m: u32, d: u32) -> Literal {
    Literal::Timestamp(NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap())
}

#[test_log::test(tokio::test)]
async fn test_revenue_this_month() {
    let dir = tempfile::tempdir().unwrap();
    let intents = StaticIntentSource::from_model_output(
        r#"```json
        {"intent": "aggregate", "metric_hint": "revenue", "time_expression": "this month"}
        ```"#,
    )
    .unwrap();
    let pipeline = pipeline_with(
        &dir,
        intents,
        RULES_WITHOUT_DEFAULTS,
        PipelineSettings::default(),
    )
    .await;

    let outcome = pipeline.ask(&Question::new("What was revenue this month?")).await;

    assert!(outcome.success, "{:?}", outcome.error);
    let statement = outcome.statement.as_ref().unwrap();
    assert_eq!(
        statement.sql,
        r#"SELECT SUM("amount") FROM "orders" WHERE "created_at" >= ? AND "created_at" < ?"#
    );
    assert_eq!(statement.params, vec![midnight(2025, 1, 1), midnight(2025, 2, 1)]);
    assert_eq!(outcome.row_count, 1);
    assert_eq!(outcome.rows[0].values, vec![Value::Float(180.0)]);

    let stages: Vec<Stage> = outcome.steps.iter().map(|step| step.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Intent,
            Stage::Resolve,
            Stage::Validate,
            Stage::Compile,
            Stage::Safety,
            Stage::Execute
        ]
    );
    assert!(outcome.steps.iter().all(|step| step.status == StageStatus::Ok));
}

#[test_log::test(tokio::test)]
async fn test_entity_listing_applies_default_filter() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline
        .run_intent(
            &Question::new("show me the orders"),
            SemanticIntent::default().with_entity("orders"),
        )
        .await;

    assert!(outcome.success, "{:?}", outcome.error);
    let statement = outcome.statement.as_ref().unwrap();
    assert_eq!(statement.sql, r#"SELECT * FROM "orders" WHERE "status" = ?"#);
    assert_eq!(statement.params, vec![Literal::Text("completed".to_string())]);
    assert_eq!(outcome.row_count, 4);
    assert_eq!(
        outcome.columns,
        vec!["id", "amount", "quantity", "status", "region", "created_at"]
    );
    assert_eq!(outcome.steps[0].status, StageStatus::Skipped);
    assert_eq!(outcome.warnings, Vec::<String>::new());
}

#[test_log::test(tokio::test)]
async fn test_metric_alone_picks_its_table() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline
        .run_intent(
            &Question::new("average order amount"),
            SemanticIntent::default()
                .with_metric("amount")
                .with_aggregation("AVG"),
        )
        .await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.canonical_query.as_ref().unwrap().table, "orders");
    assert_eq!(
        outcome.statement.as_ref().unwrap().sql,
        r#"SELECT AVG("amount") FROM "orders" WHERE "status" = ?"#
    );
    assert_eq!(outcome.rows[0].values, vec![Value::Float(92.5)]);
}

#[test_log::test(tokio::test)]
async fn test_unknown_column_stops_at_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline
        .run_intent(
            &Question::new("orders with a discount above 5"),
            SemanticIntent::default()
                .with_entity("orders")
                .with_filter("discount", ">", 5),
        )
        .await;

    assert!(!outcome.success);
    let error = outcome.error.as_ref().unwrap();
    assert_eq!(error.kind, "resolution");
    assert_eq!(error.message, "Resolution failed: Unknown column 'discount'");
    assert_eq!(
        error.hint.as_deref(),
        Some("Available columns in 'orders': id, amount, quantity, status, region, created_at")
    );
    assert_eq!(outcome.failed_stage(), Some(Stage::Resolve));
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.canonical_query.is_none());
    assert!(outcome.statement.is_none());
    assert!(outcome.rows.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_sum_over_text_is_a_type_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline
        .run_intent(
            &Question::new("total region"),
            SemanticIntent::default().with_metric("region total"),
        )
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error.as_ref().unwrap().kind, "validation");
    assert!(outcome
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("Type mismatch on 'orders.region'"));
    assert_eq!(outcome.failed_stage(), Some(Stage::Validate));
    assert!(outcome.canonical_query.is_some());
    assert!(outcome.statement.is_none());
}

#[test_log::test(tokio::test)]
async fn test_oversized_filter_value_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline
        .run_intent(
            &Question::new("orders from a very long region"),
            SemanticIntent::default()
                .with_entity("orders")
                .with_filter("region", "=", "E".repeat(1001)),
        )
        .await;

    assert_eq!(outcome.failed_stage(), Some(Stage::Validate));
    let error = outcome.error.unwrap();
    assert_eq!(
        error.message,
        "Validation failed: Value in filter on 'orders.region' is 1001 characters long (limit 1000)"
    );
    assert!(outcome.statement.is_none());
}

#[rstest]
#[case::unknown_metric(
    SemanticIntent::default().with_metric("profit"),
    "Resolution failed: Unknown metric 'profit'"
)]
#[case::unknown_entity(
    SemanticIntent::default().with_entity("invoices"),
    "Resolution failed: Unknown entity 'invoices'"
)]
#[case::unknown_metric_with_bad_aggregation(
    SemanticIntent::default().with_metric("profit").with_aggregation("MAX"),
    "Resolution failed: Unknown metric 'profit'"
)]
#[case::bad_operator(
    SemanticIntent::default().with_entity("orders").with_filter("status", "LIKE", "c%"),
    "Resolution failed: Unsupported operator 'LIKE'"
)]
#[tokio::test]
async fn test_unknown_terms_never_default(#[case] intent: SemanticIntent, #[case] message: &str) {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline.run_intent(&Question::new("?"), intent).await;

    assert_eq!(outcome.error.unwrap().message, message);
    assert!(outcome.statement.is_none());
}

#[rstest]
#[case::listing(SemanticIntent::default().with_entity("orders"))]
#[case::metric(SemanticIntent::default().with_metric("revenue").with_time_range("last 7 days"))]
#[case::count(SemanticIntent::default().with_kind("count").with_entity("order"))]
#[case::filtered(SemanticIntent::default().with_entity("orders").with_filter("region", "=", "EU"))]
#[tokio::test]
async fn test_default_filter_always_leads(#[case] intent: SemanticIntent) {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let first = pipeline.run_intent(&Question::new("q"), intent.clone()).await;
    let second = pipeline.run_intent(&Question::new("q"), intent).await;

    assert!(first.success, "{:?}", first.error);
    let statement = first.statement.unwrap();
    assert!(statement.sql.contains(r#"WHERE "status" = ?"#));
    assert_eq!(statement.params[0], Literal::Text("completed".to_string()));
    assert_eq!(statement.sql.matches("SELECT").count(), 1);
    assert!(!statement.sql.contains(';'));
    assert_eq!(statement.placeholder_count(), statement.params.len());
    assert_eq!(Some(statement), second.statement);
}

#[test_log::test(tokio::test)]
async fn test_count_question() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline
        .run_intent(
            &Question::new("how many orders?"),
            SemanticIntent::from_model_output(r#"{"intent": "count", "entity": "orders"}"#)
                .unwrap(),
        )
        .await;

    assert_eq!(
        outcome.statement.as_ref().unwrap().sql,
        r#"SELECT COUNT(*) FROM "orders" WHERE "status" = ?"#
    );
    assert_eq!(outcome.rows[0].values, vec![Value::Int(4)]);
}

#[test_log::test(tokio::test)]
async fn test_unknown_database() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline
        .ask(&Question::new("list orders").for_database("warehouse"))
        .await;
    assert_eq!(outcome.error.unwrap().kind, "unknown_database");
    assert!(outcome.steps.is_empty());

    let outcome = pipeline
        .run_intent(
            &Question::new("list orders").for_database("shop"),
            SemanticIntent::default().with_entity("orders"),
        )
        .await;
    assert!(outcome.success);
}

struct SlowIntentSource;

#[async_trait]
impl IntentSource for SlowIntentSource {
    async fn interpret(
        &self,
        _question: &str,
        _catalog: &SchemaCatalog,
    ) -> Result<SemanticIntent, IntentError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(SemanticIntent::default().with_entity("orders"))
    }
}

struct OfflineIntentSource;

#[async_trait]
impl IntentSource for OfflineIntentSource {
    async fn interpret(
        &self,
        _question: &str,
        _catalog: &SchemaCatalog,
    ) -> Result<SemanticIntent, IntentError> {
        Err(IntentError::Unavailable("model offline".to_string()))
    }
}

#[test_log::test(tokio::test)]
async fn test_intent_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let settings = PipelineSettings {
        intent_timeout: Duration::from_millis(20),
        ..PipelineSettings::default()
    };
    let pipeline = pipeline_with(&dir, SlowIntentSource, RULES_WITH_DEFAULTS, settings).await;

    let outcome = pipeline.ask(&Question::new("list orders")).await;

    assert_eq!(outcome.error.as_ref().unwrap().kind, "intent_timeout");
    assert_eq!(outcome.failed_stage(), Some(Stage::Intent));
    assert!(outcome.intent.is_none());
}

#[test_log::test(tokio::test)]
async fn test_intent_source_failure() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_with(
        &dir,
        OfflineIntentSource,
        RULES_WITH_DEFAULTS,
        PipelineSettings::default(),
    )
    .await;

    let outcome = pipeline.ask(&Question::new("list orders")).await;

    let error = outcome.error.unwrap();
    assert_eq!(error.kind, "intent");
    assert_eq!(
        error.message,
        "Intent source failed: Intent source unavailable: model offline"
    );
}

#[test_log::test(tokio::test)]
async fn test_row_cap_and_filter_limit() {
    let dir = tempfile::tempdir().unwrap();
    let settings = PipelineSettings {
        max_rows: 2,
        max_filters: 2,
        ..PipelineSettings::default()
    };
    let pipeline = pipeline_with(
        &dir,
        StaticIntentSource::new(SemanticIntent::default()),
        RULES_WITH_DEFAULTS,
        settings,
    )
    .await;

    let outcome = pipeline
        .run_intent(
            &Question::new("orders"),
            SemanticIntent::default().with_entity("orders"),
        )
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.row_count, 2);
    assert!(outcome.truncated);

    let outcome = pipeline
        .run_intent(
            &Question::new("orders"),
            SemanticIntent::default()
                .with_entity("orders")
                .with_filter("region", "=", "EU")
                .with_filter("quantity", ">", 1),
        )
        .await;
    assert_eq!(
        outcome.error.unwrap().message,
        "Validation failed: Too many filters: 3 (limit 2)"
    );
}

#[test_log::test(tokio::test)]
async fn test_reloads_publish_new_generations() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;
    assert_eq!(pipeline.rules().generation, 1);

    let rules_path = dir.path().join("rules.json");
    std::fs::write(&rules_path, RULES_WITHOUT_DEFAULTS).unwrap();
    assert_eq!(pipeline.reload_rules(&rules_path).unwrap(), 2);

    let outcome = pipeline
        .run_intent(
            &Question::new("orders"),
            SemanticIntent::default().with_entity("orders"),
        )
        .await;
    assert_eq!(outcome.rules_generation, 2);
    assert_eq!(outcome.statement.unwrap().sql, r#"SELECT * FROM "orders""#);
    assert_eq!(outcome.row_count, 5);
    assert_eq!(outcome.warnings.len(), 1);

    std::fs::write(&rules_path, "{ not json").unwrap();
    assert!(pipeline.reload_rules(&rules_path).is_err());
    assert_eq!(pipeline.rules().generation, 2);

    let writer = Connection::open(dir.path().join("shop.db")).unwrap();
    writer
        .execute_batch("CREATE TABLE refunds (id INTEGER PRIMARY KEY, amount REAL)")
        .unwrap();
    assert!(pipeline.catalog().table("refunds").is_none());
    assert_eq!(pipeline.reload_schema().await.unwrap(), 2);
    assert!(pipeline.catalog().table("refunds").is_some());
}

#[test_log::test(tokio::test)]
async fn test_outcome_serializes_for_callers() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;

    let outcome = pipeline
        .run_intent(
            &Question::new("revenue last month in EU"),
            SemanticIntent::default()
                .with_metric("revenue")
                .with_time_range("last month")
                .with_filter("region", "=", "EU"),
        )
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert!(matches!(
        outcome.canonical_query.as_ref().unwrap().projection,
        Projection::Aggregate { .. }
    ));

    let echoed = serde_json::to_value(&outcome).unwrap();
    assert_eq!(echoed["success"], json!(true));
    assert_eq!(echoed["intent"]["metric"], json!("revenue"));
    assert_eq!(echoed["canonical_query"]["projection"]["kind"], json!("aggregate"));
    assert_eq!(echoed["canonical_query"]["projection"]["function"], json!("SUM"));
    assert_eq!(
        echoed["canonical_query"]["filters"][0]["origin"],
        json!({ "source": "default", "rationale": "cancelled orders are not revenue" })
    );
    assert_eq!(echoed["canonical_query"]["time_range"]["period"], json!("last month"));
    assert_eq!(
        echoed["statement"]["params"],
        json!(["completed", "EU", "2024-12-01T00:00:00", "2025-01-01T00:00:00"])
    );
    assert_eq!(echoed["steps"][5]["stage"], json!("execute"));
    assert_eq!(echoed["rows"][0]["SUM(\"amount\")"], json!(200.0));
    assert!(echoed["error"].is_null());
}

#[test_log::test(tokio::test)]
async fn test_store_introspection_matches_pipeline_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, RULES_WITH_DEFAULTS).await;
    let store = SqliteDataStore::new(dir.path().join("shop.db"), "shop");

    let catalog = store.introspect().await.unwrap();
    assert_eq!(catalog.table_names(), pipeline.catalog().table_names());
    assert_eq!(catalog.table("orders").unwrap().row_count, Some(5));
}
