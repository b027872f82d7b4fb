use log::error;
use std::{env, fs, process};

use intent_sql::{
    config::Config,
    data_store::SqliteDataStore,
    intent_source::StaticIntentSource,
    pipeline::{Pipeline, PipelineSettings, Question},
    rules::BusinessRuleSet,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let (intent_path, question) = match (args.next(), args.collect::<Vec<_>>().join(" ")) {
        (Some(path), question) if !question.is_empty() => (path, question),
        _ => {
            eprintln!("usage: local <intent.json> <question>");
            process::exit(2);
        }
    };

    let config = Config::new().map_err(|e| {
        error!("Failed to initialize config: {}", e);
        e
    })?;

    let rules = BusinessRuleSet::load(&config.rules_path).map_err(|e| {
        error!("Failed to load business rules: {}", e);
        e
    })?;

    let intents = StaticIntentSource::from_model_output(&fs::read_to_string(&intent_path)?)
        .map_err(|e| {
            error!("Failed to read intent from {}: {}", intent_path, e);
            e
        })?;

    let data_store = SqliteDataStore::new(&config.database_path, config.database_id.clone());

    let pipeline = Pipeline::connect(
        intents,
        data_store,
        rules,
        PipelineSettings::from(&config),
    )
    .await
    .map_err(|e| {
        error!("Failed to introspect {}: {}", config.database_path, e);
        e
    })?;

    let outcome = pipeline.ask(&Question::new(question)).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.success {
        process::exit(1);
    }
    Ok(())
}
