pub mod catalog;
pub mod compiler;
pub mod config;
pub mod data_store;
pub mod intent;
pub mod intent_source;
pub mod pipeline;
pub mod query;
pub mod rules;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use pipeline::{Pipeline, PipelineError, QueryOutcome, Question};
