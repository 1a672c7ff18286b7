//! Together inference API client.
//!
//! Native reqwest-based client for the raw-prompt `/inference` endpoint.
//! Conversation formatting happens locally through [`PromptTemplate`]; the
//! provider only ever sees one flat prompt string.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::InferenceConfig;
use crate::error::InferenceError;
use crate::llm::prompt::PromptTemplate;
use crate::llm::{Completion, InferenceClient};
use crate::store::Transcript;

const PROVIDER: &str = "together";

/// Together inference API client.
pub struct TogetherClient {
    client: Client,
    config: InferenceConfig,
    template: PromptTemplate,
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    model: &'a str,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
    top_k: u32,
    top_p: f32,
    repetition_penalty: f32,
    stop: &'a [String],
}

impl InferenceRequest<'_> {
    /// Prompt length in characters, the unit context bounds are counted in.
    fn prompt_chars(&self) -> usize {
        self.prompt.chars().count()
    }
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    output: Option<InferenceOutput>,
}

#[derive(Debug, Deserialize)]
struct InferenceOutput {
    #[serde(default)]
    choices: Vec<InferenceChoice>,
}

#[derive(Debug, Deserialize)]
struct InferenceChoice {
    #[serde(default)]
    text: serde_json::Value,
}

impl TogetherClient {
    /// Create a new client. Fails only if the HTTP client cannot be built.
    pub fn new(config: InferenceConfig) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| InferenceError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        let template = PromptTemplate::new(config.system_prompt.clone());

        tracing::info!(model = %config.model, endpoint = %config.endpoint, "Using Together inference");
        Ok(Self {
            client,
            config,
            template,
        })
    }

    fn request_body(&self, context: &Transcript, input: &str) -> InferenceRequest<'_> {
        InferenceRequest {
            model: &self.config.model,
            prompt: self.template.render(context, input),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_k: self.config.top_k,
            top_p: self.config.top_p,
            repetition_penalty: self.config.repetition_penalty,
            stop: &self.config.stop,
        }
    }
}

/// Extract the first choice's text from a response body.
fn parse_completion(body: &str) -> Result<Completion, InferenceError> {
    let response: InferenceResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("JSON parse error: {e}"),
        })?;

    response
        .output
        .and_then(|output| output.choices.into_iter().next())
        .map(|choice| Completion::from(choice.text))
        .ok_or_else(|| InferenceError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "response has no output choices".to_string(),
        })
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl InferenceClient for TogetherClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn complete(
        &self,
        user_id: &str,
        input: &str,
        context: &Transcript,
    ) -> Result<Completion, InferenceError> {
        let body = self.request_body(context, input);
        tracing::debug!(
            user_id,
            prompt_chars = body.prompt_chars(),
            context_turns = context.len(),
            "Sending inference request"
        );

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let response_text = response
            .text()
            .await
            .map_err(|e| InferenceError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to read response body: {e}"),
            })?;

        tracing::debug!(user_id, status = status.as_u16(), "Inference response received");

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => InferenceError::AuthFailed {
                    provider: PROVIDER.to_string(),
                },
                429 => InferenceError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after,
                },
                code => InferenceError::Status {
                    provider: PROVIDER.to_string(),
                    status: code,
                    body: response_text,
                },
            });
        }

        parse_completion(&response_text)
    }
}
