//! Inference client for the chat worker.
//!
//! The pipeline only sees [`InferenceClient`]: one call per job, turning a
//! user's new input plus their prior transcript into a raw completion.
//! [`TogetherClient`] is the HTTP implementation.

pub mod prompt;
pub mod together;

pub use prompt::PromptTemplate;
pub use together::TogetherClient;

use async_trait::async_trait;

use crate::error::InferenceError;
use crate::store::Transcript;

/// A completion exactly as the provider returned it, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The provider returned a string (possibly empty or whitespace).
    Text(String),
    /// The provider returned a non-string value where text was expected.
    NonText(serde_json::Value),
}

impl Completion {
    /// Short description of the value's JSON type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::NonText(serde_json::Value::Null) => "null",
            Self::NonText(serde_json::Value::Bool(_)) => "boolean",
            Self::NonText(serde_json::Value::Number(_)) => "number",
            Self::NonText(serde_json::Value::String(_)) => "string",
            Self::NonText(serde_json::Value::Array(_)) => "array",
            Self::NonText(serde_json::Value::Object(_)) => "object",
        }
    }
}

impl From<serde_json::Value> for Completion {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => Self::Text(text),
            other => Self::NonText(other),
        }
    }
}

/// Remote text completion for one conversational turn.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Provider name used in logs and errors.
    fn name(&self) -> &str;

    /// Produce a completion for `input` given the user's prior `context`.
    async fn complete(
        &self,
        user_id: &str,
        input: &str,
        context: &Transcript,
    ) -> Result<Completion, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completion_from_json_value() {
        assert_eq!(Completion::from(json!("hi")), Completion::Text("hi".into()));
        assert_eq!(Completion::from(json!(null)), Completion::NonText(json!(null)));
        assert_eq!(Completion::from(json!(42)).type_name(), "number");
        assert_eq!(Completion::from(json!({"a": 1})).type_name(), "object");
    }
}
