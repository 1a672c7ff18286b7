//! Error types for the chat worker.

use std::time::Duration;

/// Top-level error type for the worker process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Context store error: {0}")]
    ContextStore(#[from] ContextStoreError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Unhandled fault: {0}")]
    Fault(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnvVars(Vec<String>),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Conversation context store errors.
#[derive(Debug, thiserror::Error)]
pub enum ContextStoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Inference provider errors.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Job queue gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue {name} failed to start consuming: {reason}")]
    ConsumeFailed { name: String, reason: String },

    #[error("Failed to acknowledge delivery {tag} on {name}: {reason}")]
    AckFailed { name: String, tag: u64, reason: String },

    #[error("Failed to publish result on {name}: {reason}")]
    PublishFailed { name: String, reason: String },

    #[error("Queue {name} is closed")]
    Closed { name: String },
}

/// Why an inference step produced no usable response.
#[derive(Debug, thiserror::Error)]
pub enum InferenceFailure {
    #[error("provider call failed: {0}")]
    Provider(#[source] InferenceError),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider returned a non-text completion ({0})")]
    NonTextResponse(String),

    #[error("provider returned an empty completion")]
    EmptyResponse,
}

/// Per-job failure taxonomy. Every variant ends the job as discarded.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error("malformed job: {reason}")]
    Malformed { reason: String },

    #[error("inference failed: {0}")]
    Inference(#[from] InferenceFailure),

    #[error("publishing result failed: {0}")]
    Publish(#[source] QueueError),

    #[error("publishing result timed out after {0:?}")]
    PublishTimeout(Duration),
}

impl JobFailure {
    /// Stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed_job",
            Self::Inference(InferenceFailure::Provider(_)) => "inference_provider",
            Self::Inference(InferenceFailure::Timeout(_)) => "inference_timeout",
            Self::Inference(InferenceFailure::NonTextResponse(_)) => "inference_non_text",
            Self::Inference(InferenceFailure::EmptyResponse) => "inference_empty",
            Self::Publish(_) => "publish",
            Self::PublishTimeout(_) => "publish_timeout",
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
