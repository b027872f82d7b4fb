use crate::catalog::SchemaCatalog;
use crate::intent::{IntentError, SemanticIntent};
use async_trait::async_trait;
use log::debug;

/// Turns a natural-language question into an untrusted [`SemanticIntent`].
///
/// Implementations may call out to a language model; whatever they return is
/// resolved against the schema and rules before it can reach the store.
#[async_trait]
pub trait IntentSource: Send + Sync {
    async fn interpret(
        &self,
        question: &str,
        catalog: &SchemaCatalog,
    ) -> Result<SemanticIntent, IntentError>;
}

/// Returns the same intent for every question.
pub struct StaticIntentSource {
    intent: SemanticIntent,
}

impl StaticIntentSource {
    pub fn new(intent: SemanticIntent) -> Self {
        Self { intent }
    }

    /// Wraps raw model output, such as a recorded completion.
    pub fn from_model_output(text: &str) -> Result<Self, IntentError> {
        SemanticIntent::from_model_output(text).map(Self::new)
    }
}

#[async_trait]
impl IntentSource for StaticIntentSource {
    async fn interpret(
        &self,
        question: &str,
        catalog: &SchemaCatalog,
    ) -> Result<SemanticIntent, IntentError> {
        debug!(
            "Static intent for '{}' against {} tables",
            question,
            catalog.len()
        );
        Ok(self.intent.clone())
    }
}
