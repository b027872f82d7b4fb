use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntentError {
    #[error("Invalid JSON from intent source: {0}")]
    InvalidJson(String),

    #[error("Intent source unavailable: {0}")]
    Unavailable(String),
}

/// One slot of an untrusted intent.
///
/// `Absent` means the model said nothing (missing key, `null` or a blank
/// string); `Malformed` keeps whatever unexpected JSON it produced instead.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Hint<T> {
    #[default]
    Absent,
    Given(T),
    Malformed(Value),
}

impl<T> Hint<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Hint::Absent)
    }

    pub fn as_given(&self) -> Option<&T> {
        match self {
            Hint::Given(value) => Some(value),
            _ => None,
        }
    }
}

impl Hint<String> {
    fn from_json(value: Option<Value>) -> Self {
        match value {
            None | Some(Value::Null) => Hint::Absent,
            Some(Value::String(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    Hint::Absent
                } else {
                    Hint::Given(text.to_string())
                }
            }
            Some(other) => Hint::Malformed(other),
        }
    }

    /// Human readable form used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Hint::Absent => String::new(),
            Hint::Given(text) => text.clone(),
            Hint::Malformed(raw) => raw.to_string(),
        }
    }
}

impl<T: Serialize> Serialize for Hint<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Hint::Absent => serializer.serialize_none(),
            Hint::Given(value) => value.serialize(serializer),
            Hint::Malformed(raw) => raw.serialize(serializer),
        }
    }
}

/// A comparison the model thinks the question implies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawFilter {
    pub field: Hint<String>,
    pub operator: Hint<String>,
    pub value: Value,
}

impl RawFilter {
    pub fn new(field: &str, operator: &str, value: impl Into<Value>) -> Self {
        Self {
            field: Hint::from_json(Some(Value::String(field.to_string()))),
            operator: Hint::from_json(Some(Value::String(operator.to_string()))),
            value: value.into(),
        }
    }

    fn from_json(value: Value) -> Self {
        match value {
            Value::Object(mut fields) => {
                let mut take = |keys: &[&str]| keys.iter().find_map(|key| fields.remove(*key));
                let field = Hint::from_json(take(&["field", "column", "column_hint"]));
                let operator = Hint::from_json(take(&["operator", "op"]));
                let value = take(&["value", "value_hint"]).unwrap_or(Value::Null);
                RawFilter {
                    field,
                    operator,
                    value,
                }
            }
            other => RawFilter {
                field: Hint::Malformed(other),
                operator: Hint::Absent,
                value: Value::Null,
            },
        }
    }
}

/// The untrusted, structured guess of what a question asks for.
///
/// Nothing here is checked against the schema or the rule set; that is the
/// resolver's job. Field names from both the current and the older model
/// prompt (`metric_hint`, `entity_hint`, `filter_hints`, ...) are accepted.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SemanticIntent {
    /// `aggregate`, `retrieve` or `count`
    pub kind: Hint<String>,
    pub metric: Hint<String>,
    pub entity: Hint<String>,
    pub aggregation: Hint<String>,
    pub time_range: Hint<String>,
    pub filters: Vec<RawFilter>,
}

impl SemanticIntent {
    /// Parses raw model output, tolerating a surrounding markdown code fence.
    pub fn from_model_output(text: &str) -> Result<Self, IntentError> {
        let mut cleaned = text.trim();
        if let Some(rest) = cleaned.strip_prefix("```json") {
            cleaned = rest;
        } else if let Some(rest) = cleaned.strip_prefix("```") {
            cleaned = rest;
        }
        if let Some(rest) = cleaned.strip_suffix("```") {
            cleaned = rest;
        }
        serde_json::from_str(cleaned.trim()).map_err(|e| IntentError::InvalidJson(e.to_string()))
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Hint::from_json(Some(Value::String(kind.to_string())));
        self
    }

    pub fn with_metric(mut self, metric: &str) -> Self {
        self.metric = Hint::from_json(Some(Value::String(metric.to_string())));
        self
    }

    pub fn with_entity(mut self, entity: &str) -> Self {
        self.entity = Hint::from_json(Some(Value::String(entity.to_string())));
        self
    }

    pub fn with_aggregation(mut self, aggregation: &str) -> Self {
        self.aggregation = Hint::from_json(Some(Value::String(aggregation.to_string())));
        self
    }

    pub fn with_time_range(mut self, period: &str) -> Self {
        self.time_range = Hint::from_json(Some(Value::String(period.to_string())));
        self
    }

    pub fn with_filter(mut self, field: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.filters.push(RawFilter::new(field, operator, value));
        self
    }
}

impl<'de> Deserialize<'de> for SemanticIntent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct IntentHelper {
            #[serde(default, alias = "intent")]
            kind: Option<Value>,
            #[serde(default, alias = "metric_hint")]
            metric: Option<Value>,
            #[serde(default, alias = "entity_hint")]
            entity: Option<Value>,
            #[serde(default, alias = "aggregation_hint")]
            aggregation: Option<Value>,
            #[serde(default, alias = "time_expression")]
            time_range: Option<Value>,
            #[serde(default, alias = "filter_hints")]
            filters: Option<Value>,
        }

        let helper = IntentHelper::deserialize(deserializer)?;

        let filters = match helper.filters {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.into_iter().map(RawFilter::from_json).collect(),
            Some(other) => vec![RawFilter::from_json(other)],
        };

        Ok(SemanticIntent {
            kind: Hint::from_json(helper.kind),
            metric: Hint::from_json(helper.metric),
            entity: Hint::from_json(helper.entity),
            aggregation: Hint::from_json(helper.aggregation),
            time_range: Hint::from_json(helper.time_range),
            filters,
        })
    }
}
