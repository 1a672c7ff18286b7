//! Configuration types.
//!
//! Everything is read from environment variables once at startup. Required
//! values are collected together so a misconfigured deployment reports every
//! missing variable in one error.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Together inference endpoint (raw prompt completion API).
pub const DEFAULT_ENDPOINT: &str = "https://api.together.xyz/inference";

/// Default model served behind the endpoint.
pub const DEFAULT_MODEL: &str = "togethercomputer/StripedHyena-Nous-7B";

/// Inference provider configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub api_key: SecretString,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub stop: Vec<String>,
    /// Injected into the `<<SYS>>` block of every prompt. May be empty.
    pub system_prompt: String,
    /// HTTP request timeout for a single completion call.
    pub request_timeout: Duration,
}

impl InferenceConfig {
    /// Configuration with the deployment defaults and the given key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 250,
            temperature: 0.8,
            top_k: 80,
            top_p: 0.5,
            repetition_penalty: 1.1,
            stop: vec!["</s>".to_string()],
            system_prompt: String::new(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Size limits applied to every stored transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBounds {
    /// Maximum number of turns kept per user.
    pub max_turns: usize,
    /// Maximum characters (inputs plus responses) kept per user.
    pub max_chars: usize,
}

impl Default for ContextBounds {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_chars: 4_000,
        }
    }
}

/// Which context store backend to open at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Durable libSQL database file.
    LibSql { path: PathBuf },
    /// Process-local store; history is lost on restart.
    Memory,
}

/// Concurrency and shutdown limits for the worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    /// Upper bound on each store, inference and queue call of a single job.
    pub job_timeout: Duration,
    /// Maximum number of jobs in flight at once.
    pub max_concurrent_jobs: usize,
    /// How long draining waits for in-flight jobs before aborting them.
    pub drain_timeout: Duration,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(60),
            max_concurrent_jobs: 8,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub inference: InferenceConfig,
    pub store: StoreBackend,
    pub bounds: ContextBounds,
    pub limits: WorkerLimits,
}

impl WorkerConfig {
    /// Load configuration from the environment.
    ///
    /// Fails with [`ConfigError::MissingEnvVars`] naming every absent
    /// required variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut missing = Vec::new();

        let api_key = optional_env("TOGETHER_API_KEY")?;
        if api_key.is_none() {
            missing.push("TOGETHER_API_KEY".to_string());
        }

        let store = match optional_env("CONTEXT_STORE")?.as_deref() {
            None | Some("libsql") => match optional_env("CONTEXT_DB_PATH")? {
                Some(path) => Some(StoreBackend::LibSql {
                    path: PathBuf::from(path),
                }),
                None => {
                    missing.push("CONTEXT_DB_PATH".to_string());
                    None
                }
            },
            Some("memory") => Some(StoreBackend::Memory),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "CONTEXT_STORE".to_string(),
                    message: format!("expected 'libsql' or 'memory', got '{other}'"),
                });
            }
        };

        let (Some(api_key), Some(store)) = (api_key, store) else {
            return Err(ConfigError::MissingEnvVars(missing));
        };

        let limits = WorkerLimits {
            job_timeout: Duration::from_secs(parse_optional_env("JOB_TIMEOUT_SECS", 60u64)?),
            max_concurrent_jobs: parse_optional_env("MAX_CONCURRENT_JOBS", 8usize)?,
            drain_timeout: Duration::from_secs(parse_optional_env("DRAIN_TIMEOUT_SECS", 30u64)?),
        };
        require_positive("MAX_CONCURRENT_JOBS", limits.max_concurrent_jobs)?;

        let bounds = ContextBounds {
            max_turns: parse_optional_env("CONTEXT_MAX_TURNS", 20usize)?,
            max_chars: parse_optional_env("CONTEXT_MAX_CHARS", 4_000usize)?,
        };
        require_positive("CONTEXT_MAX_TURNS", bounds.max_turns)?;
        require_positive("CONTEXT_MAX_CHARS", bounds.max_chars)?;

        let mut inference = InferenceConfig::with_api_key(api_key);
        if let Some(endpoint) = optional_env("INFERENCE_ENDPOINT")? {
            inference.endpoint = endpoint;
        }
        if let Some(model) = optional_env("INFERENCE_MODEL")? {
            inference.model = model;
        }
        inference.max_tokens = parse_optional_env("INFERENCE_MAX_TOKENS", inference.max_tokens)?;
        inference.temperature =
            parse_optional_env("INFERENCE_TEMPERATURE", inference.temperature)?;
        inference.top_k = parse_optional_env("INFERENCE_TOP_K", inference.top_k)?;
        inference.top_p = parse_optional_env("INFERENCE_TOP_P", inference.top_p)?;
        inference.repetition_penalty = parse_optional_env(
            "INFERENCE_REPETITION_PENALTY",
            inference.repetition_penalty,
        )?;
        if let Some(stop) = optional_env("INFERENCE_STOP")? {
            inference.stop = stop
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(prompt) = optional_env("SYSTEM_PROMPT")? {
            inference.system_prompt = prompt;
        }
        inference.request_timeout = limits.job_timeout;

        Ok(Self {
            inference,
            store,
            bounds,
            limits,
        })
    }
}

fn require_positive(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

// Helper functions

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("failed to read {key}: {e}"))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
