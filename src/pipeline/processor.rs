//! Task pipeline: turns one queue delivery into one published reply.
//!
//! Flow:
//! 1. Ingest: parse and validate the payload, take the user's turn ticket
//! 2. Load the user's transcript (a failed read degrades to an empty one)
//! 3. Inference
//! 4. Validate the completion (text, non-empty after trimming)
//! 5. Append the turn (a failed write is logged, the reply still goes out)
//! 6. Publish the result, then settle the delivery
//!
//! Every call into the store, the inference client or the queue is bounded
//! by the job timeout. A stalled read or append counts as a failed one.
//!
//! Any failure discards the job. Malformed payloads are acked so they are
//! never redelivered; every other failure is rejected without requeue.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{InferenceFailure, JobFailure};
use crate::llm::{Completion, InferenceClient};
use crate::pipeline::sequencer::UserSequencer;
use crate::pipeline::types::{AcceptedJob, Job, JobOutcome, JobResult, JobStage};
use crate::queue::{Delivery, QueueGateway};
use crate::store::{ContextStore, Transcript, Turn};

/// Runs jobs from ingestion to settlement.
///
/// Shared by every job task of a worker; per-user ordering is enforced by
/// the internal [`UserSequencer`].
pub struct TaskPipeline {
    store: Arc<dyn ContextStore>,
    llm: Arc<dyn InferenceClient>,
    queue: Arc<dyn QueueGateway>,
    sequencer: UserSequencer,
    job_timeout: Duration,
}

impl TaskPipeline {
    pub fn new(
        store: Arc<dyn ContextStore>,
        llm: Arc<dyn InferenceClient>,
        queue: Arc<dyn QueueGateway>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            store,
            llm,
            queue,
            sequencer: UserSequencer::new(),
            job_timeout,
        }
    }

    /// Validate a delivery and reserve its place in the user's turn order.
    ///
    /// Synchronous on purpose: callers ingest deliveries in arrival order
    /// before spawning, so tickets follow acceptance order.
    pub fn ingest(&self, delivery: &Delivery) -> Result<AcceptedJob, JobFailure> {
        let job = Job::parse(&delivery.payload)?;
        let ticket = self.sequencer.ticket(&job.user_id);
        Ok(AcceptedJob::new(delivery.tag, job, ticket))
    }

    /// Run an accepted job through context, inference, persistence and
    /// publishing. On failure the job ends in [`JobStage::Discarded`].
    pub async fn run(&self, accepted: &mut AcceptedJob) -> Result<JobResult, JobFailure> {
        match self.run_stages(accepted).await {
            Ok(result) => Ok(result),
            Err(failure) => {
                let _ = accepted.transition_to(JobStage::Discarded, Some(failure.to_string()));
                Err(failure)
            }
        }
    }

    /// Settle an ingested delivery: run it if it was accepted, then ack or
    /// reject it and log the outcome.
    pub async fn handle(
        &self,
        tag: u64,
        ingested: Result<AcceptedJob, JobFailure>,
    ) -> JobOutcome {
        let mut accepted = match ingested {
            Ok(accepted) => accepted,
            Err(failure) => {
                error!(tag, kind = failure.kind(), error = %failure, "Discarding malformed job");
                self.settle(tag, true).await;
                return JobOutcome::Discarded(failure);
            }
        };

        let outcome = match self.run(&mut accepted).await {
            Ok(result) => {
                info!(
                    job_id = %accepted.job_id,
                    user_id = %accepted.user_id(),
                    chars = result.response.chars().count(),
                    "Job published"
                );
                self.settle(accepted.tag, true).await;
                JobOutcome::Published(result)
            }
            Err(failure) => {
                log_failure(&accepted, &failure);
                self.settle(accepted.tag, false).await;
                JobOutcome::Discarded(failure)
            }
        };

        debug!(
            job_id = %accepted.job_id,
            path = ?accepted.stage_path(),
            "Job finished"
        );
        // Dropping the job releases its ticket to the user's next job.
        drop(accepted);
        outcome
    }

    /// Ingest and handle one delivery.
    pub async fn process(&self, delivery: Delivery) -> JobOutcome {
        let ingested = self.ingest(&delivery);
        self.handle(delivery.tag, ingested).await
    }

    // ── Stages ──────────────────────────────────────────────────────

    async fn run_stages(&self, accepted: &mut AcceptedJob) -> Result<JobResult, JobFailure> {
        accepted.ticket.wait_turn().await;
        let user_id = accepted.job.user_id.clone();
        let query = accepted.job.query.clone();

        info!(
            job_id = %accepted.job_id,
            user_id = %user_id,
            tag = accepted.tag,
            "Processing job"
        );

        // Step 1: context
        let context = match timeout(self.job_timeout, self.store.get(&user_id)).await {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => {
                warn!(
                    job_id = %accepted.job_id,
                    user_id = %user_id,
                    error = %e,
                    "Context read failed, continuing without history"
                );
                Transcript::new()
            }
            Err(_) => {
                warn!(
                    job_id = %accepted.job_id,
                    user_id = %user_id,
                    timeout = ?self.job_timeout,
                    "Context read timed out, continuing without history"
                );
                Transcript::new()
            }
        };
        advance(accepted, JobStage::ContextLoaded);

        // Step 2: inference
        let completion = self.infer(&user_id, &query, &context).await?;
        advance(accepted, JobStage::Inferred);

        // Step 3: validation
        let response = validate(completion)?;
        advance(accepted, JobStage::ResponseValidated);

        // Step 4: persistence
        let turn = Turn::new(query.as_str(), response.as_str());
        match timeout(self.job_timeout, self.store.append(&user_id, &turn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                job_id = %accepted.job_id,
                user_id = %user_id,
                error = %e,
                "Failed to store turn, publishing anyway"
            ),
            Err(_) => warn!(
                job_id = %accepted.job_id,
                user_id = %user_id,
                timeout = ?self.job_timeout,
                "Storing turn timed out, publishing anyway"
            ),
        }
        advance(accepted, JobStage::Persisted);

        // Step 5: publish
        let result = JobResult::new(user_id, response);
        match timeout(self.job_timeout, self.queue.publish(&result)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(JobFailure::Publish(e)),
            Err(_) => return Err(JobFailure::PublishTimeout(self.job_timeout)),
        }
        advance(accepted, JobStage::Published);

        Ok(result)
    }

    async fn infer(
        &self,
        user_id: &str,
        query: &str,
        context: &Transcript,
    ) -> Result<Completion, InferenceFailure> {
        match timeout(self.job_timeout, self.llm.complete(user_id, query, context)).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(e)) => Err(InferenceFailure::Provider(e)),
            Err(_) => Err(InferenceFailure::Timeout(self.job_timeout)),
        }
    }

    /// Ack (`handled`) or reject a delivery. Settlement errors are only
    /// logged; the transport will redeliver if it never saw the settlement.
    async fn settle(&self, tag: u64, handled: bool) {
        let settlement = async {
            if handled {
                self.queue.ack(tag).await
            } else {
                self.queue.reject(tag).await
            }
        };
        match timeout(self.job_timeout, settlement).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(tag, handled, error = %e, "Failed to settle delivery"),
            Err(_) => {
                error!(tag, handled, timeout = ?self.job_timeout, "Settling delivery timed out")
            }
        }
    }
}

fn advance(accepted: &mut AcceptedJob, stage: JobStage) {
    if let Err(e) = accepted.transition_to(stage, None) {
        warn!(job_id = %accepted.job_id, error = %e, "Unexpected stage transition");
    }
}

/// Accept only non-empty text; the returned response is trimmed.
fn validate(completion: Completion) -> Result<String, InferenceFailure> {
    match completion {
        Completion::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Err(InferenceFailure::EmptyResponse)
            } else {
                Ok(trimmed.to_string())
            }
        }
        other => Err(InferenceFailure::NonTextResponse(other.type_name().to_string())),
    }
}

fn log_failure(accepted: &AcceptedJob, failure: &JobFailure) {
    let job_id = accepted.job_id;
    let user_id = accepted.user_id();
    let query = accepted.job.query.as_str();
    let kind = failure.kind();

    match failure {
        JobFailure::Malformed { .. } => {
            error!(%job_id, user_id, query, kind, error = %failure, "Discarding malformed job")
        }
        JobFailure::Inference(InferenceFailure::Provider(_)) => {
            error!(%job_id, user_id, query, kind, error = %failure, "Inference provider call failed")
        }
        JobFailure::Inference(InferenceFailure::Timeout(_)) => {
            error!(%job_id, user_id, query, kind, error = %failure, "Inference timed out")
        }
        JobFailure::Inference(InferenceFailure::NonTextResponse(_)) => {
            error!(%job_id, user_id, query, kind, error = %failure, "Inference returned a non-text response")
        }
        JobFailure::Inference(InferenceFailure::EmptyResponse) => {
            error!(%job_id, user_id, query, kind, "Inference returned an empty response")
        }
        JobFailure::Publish(_) => {
            error!(%job_id, user_id, query, kind, error = %failure, "Failed to publish result")
        }
        JobFailure::PublishTimeout(_) => {
            error!(%job_id, user_id, query, kind, error = %failure, "Publishing result timed out")
        }
    }
}
