//! Shared types for the job processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobFailure;
use crate::pipeline::sequencer::TurnTicket;

// ── Wire types ──────────────────────────────────────────────────────

/// Inbound job: one conversational reply requested for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub user_id: String,
    pub query: String,
}

impl Job {
    /// Parse and validate a raw payload.
    ///
    /// The payload must be a JSON object with non-empty string `userId` and
    /// `query` fields. Unknown fields are ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, JobFailure> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| JobFailure::malformed(format!("payload is not valid JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| JobFailure::malformed("payload is not a JSON object"))?;

        let field = |name: &str| -> Result<String, JobFailure> {
            match object.get(name) {
                None | Some(serde_json::Value::Null) => {
                    Err(JobFailure::malformed(format!("missing {name}")))
                }
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                    Err(JobFailure::malformed(format!("{name} is empty")))
                }
                Some(serde_json::Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(JobFailure::malformed(format!("{name} must be a string"))),
            }
        };

        Ok(Self {
            user_id: field("userId")?,
            query: field("query")?,
        })
    }
}

/// Outbound result for a successfully processed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub user_id: String,
    /// Always non-empty and trimmed.
    pub response: String,
}

impl JobResult {
    pub fn new(user_id: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            response: response.into(),
        }
    }
}

// ── Job stages ──────────────────────────────────────────────────────

/// Stage of a job inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Received,
    Validated,
    ContextLoaded,
    Inferred,
    ResponseValidated,
    Persisted,
    Published,
    Discarded,
}

impl JobStage {
    /// Check if this stage allows transitioning to another stage.
    pub fn can_transition_to(&self, target: JobStage) -> bool {
        use JobStage::*;

        if target == Discarded {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (Received, Validated)
                | (Validated, ContextLoaded)
                | (ContextLoaded, Inferred)
                | (Inferred, ResponseValidated)
                | (ResponseValidated, Persisted)
                | (Persisted, Published)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Discarded)
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::ContextLoaded => "context_loaded",
            Self::Inferred => "inferred",
            Self::ResponseValidated => "response_validated",
            Self::Persisted => "persisted",
            Self::Published => "published",
            Self::Discarded => "discarded",
        };
        write!(f, "{s}")
    }
}

/// A stage transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: JobStage,
    pub to: JobStage,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

// ── Accepted job ────────────────────────────────────────────────────

/// A validated job that holds its place in the user's turn order.
#[derive(Debug)]
pub struct AcceptedJob {
    /// Correlation ID for logs.
    pub job_id: Uuid,
    /// Delivery tag used to settle the queue message.
    pub tag: u64,
    pub job: Job,
    pub stage: JobStage,
    pub transitions: Vec<StageTransition>,
    pub accepted_at: DateTime<Utc>,
    pub(crate) ticket: TurnTicket,
}

impl AcceptedJob {
    pub(crate) fn new(tag: u64, job: Job, ticket: TurnTicket) -> Self {
        let mut accepted = Self {
            job_id: Uuid::new_v4(),
            tag,
            job,
            stage: JobStage::Received,
            transitions: Vec::new(),
            accepted_at: Utc::now(),
            ticket,
        };
        // Received -> Validated is always legal.
        let _ = accepted.transition_to(JobStage::Validated, None);
        accepted
    }

    pub fn user_id(&self) -> &str {
        &self.job.user_id
    }

    /// Transition to a new stage.
    pub fn transition_to(
        &mut self,
        new_stage: JobStage,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.stage.can_transition_to(new_stage) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.stage, new_stage
            ));
        }
        self.transitions.push(StageTransition {
            from: self.stage,
            to: new_stage,
            timestamp: Utc::now(),
            reason,
        });
        self.stage = new_stage;
        Ok(())
    }

    /// Stages visited so far, starting with `Received`.
    pub fn stage_path(&self) -> Vec<JobStage> {
        std::iter::once(JobStage::Received)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }
}

/// Terminal result of handling one delivery.
#[derive(Debug)]
pub enum JobOutcome {
    Published(JobResult),
    Discarded(JobFailure),
}

impl JobOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published(_))
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            Self::Published(_) => None,
            Self::Discarded(failure) => Some(failure),
        }
    }
}
