//! Worker lifecycle controller.
//!
//! Owns the consume loop: pulls deliveries while RUNNING, hands each one to
//! the pipeline as its own task, and on a signal or end of input drains
//! in-flight jobs before closing the queue.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::WorkerLimits;
use crate::error::{Error, Result};
use crate::pipeline::TaskPipeline;
use crate::queue::QueueGateway;
use crate::worker::state::{ShutdownReason, WorkerState};

/// Why the consume loop ended.
enum Stop {
    Graceful(ShutdownReason),
    Fault(String),
}

/// Drives a [`TaskPipeline`] from a [`QueueGateway`] until shutdown.
pub struct WorkerController {
    pipeline: Arc<TaskPipeline>,
    queue: Arc<dyn QueueGateway>,
    limits: WorkerLimits,
    state: watch::Sender<WorkerState>,
}

impl WorkerController {
    pub fn new(
        pipeline: Arc<TaskPipeline>,
        queue: Arc<dyn QueueGateway>,
        limits: WorkerLimits,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            pipeline,
            queue,
            limits,
            state,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Consume until `shutdown` resolves or the delivery stream ends, then
    /// drain and close the queue.
    ///
    /// Returns why the worker stopped, or [`Error::Fault`] when a job task
    /// panicked or the drain timed out.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<ShutdownReason> {
        let mut deliveries = match self.queue.consume().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(queue = self.queue.name(), error = %e, "Failed to start consuming");
                self.transition(WorkerState::Stopped, "consume failed");
                return Err(e.into());
            }
        };
        self.transition(WorkerState::Running, "consuming");

        let permits = Arc::new(Semaphore::new(self.limits.max_concurrent_jobs.max(1)));
        let mut jobs: JoinSet<()> = JoinSet::new();
        let mut permit: Option<OwnedSemaphorePermit> = None;
        tokio::pin!(shutdown);

        let stop = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break Stop::Graceful(ShutdownReason::Signal),

                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Some(fault) = job_fault(joined) {
                        break Stop::Fault(fault);
                    }
                }

                acquired = permits.clone().acquire_owned(), if permit.is_none() => {
                    match acquired {
                        Ok(acquired) => permit = Some(acquired),
                        Err(e) => break Stop::Fault(format!("job permits unavailable: {e}")),
                    }
                }

                next = deliveries.next(), if permit.is_some() => {
                    let Some(delivery) = next else {
                        break Stop::Graceful(ShutdownReason::QueueClosed);
                    };
                    let Some(held) = permit.take() else {
                        continue;
                    };
                    // Ingest here, in arrival order, so per-user tickets
                    // follow acceptance order.
                    let ingested = self.pipeline.ingest(&delivery);
                    let pipeline = self.pipeline.clone();
                    debug!(tag = delivery.tag, in_flight = jobs.len() + 1, "Dispatching delivery");
                    jobs.spawn(async move {
                        let _held = held;
                        pipeline.handle(delivery.tag, ingested).await;
                    });
                }
            }
        };
        drop(permit);
        drop(deliveries);

        let (reason, mut fault) = match stop {
            Stop::Graceful(reason) => {
                self.transition(WorkerState::Draining, &reason.to_string());
                (Some(reason), None)
            }
            Stop::Fault(fault) => {
                error!(error = %fault, "Unhandled fault, draining");
                self.transition(WorkerState::Draining, "fault");
                (None, Some(fault))
            }
        };

        if let Some(drain_fault) = self.drain(&mut jobs).await {
            fault.get_or_insert(drain_fault);
        }

        if let Err(e) = self.queue.close().await {
            error!(queue = self.queue.name(), error = %e, "Failed to close queue");
        }
        self.transition(WorkerState::Stopped, "queue closed");

        if let Some(fault) = fault {
            return Err(Error::Fault(fault));
        }
        let reason = reason.unwrap_or(ShutdownReason::Signal);
        info!(reason = %reason, "Worker stopped");
        Ok(reason)
    }

    /// Wait for in-flight jobs, bounded by the drain timeout. Returns the
    /// first fault seen, or a timeout fault after aborting leftovers.
    async fn drain(&self, jobs: &mut JoinSet<()>) -> Option<String> {
        let in_flight = jobs.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight jobs");
        }

        let wait_all = async {
            let mut first_fault = None;
            while let Some(joined) = jobs.join_next().await {
                if let Some(fault) = job_fault(joined) {
                    first_fault.get_or_insert(fault);
                }
            }
            first_fault
        };

        let waited = tokio::time::timeout(self.limits.drain_timeout, wait_all).await;
        match waited {
            Ok(fault) => fault,
            Err(_) => {
                let remaining = jobs.len();
                warn!(
                    remaining,
                    timeout = ?self.limits.drain_timeout,
                    "Drain timed out, aborting remaining jobs"
                );
                jobs.shutdown().await;
                Some(format!(
                    "drain timed out after {:?} with {remaining} jobs in flight",
                    self.limits.drain_timeout
                ))
            }
        }
    }

    fn transition(&self, to: WorkerState, reason: &str) {
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(to) {
                warn!(from = %current, to = %to, "Ignoring invalid worker state transition");
                return false;
            }
            info!(from = %current, to = %to, reason, "Worker state changed");
            *current = to;
            true
        });
    }
}

/// A panicked job is a fault; a cancelled one is not.
fn job_fault(joined: std::result::Result<(), JoinError>) -> Option<String> {
    match joined {
        Ok(()) => None,
        Err(e) if e.is_panic() => {
            error!(error = %e, "Job task panicked");
            Some(format!("job task panicked: {e}"))
        }
        Err(e) => {
            debug!(error = %e, "Job task cancelled");
            None
        }
    }
}
