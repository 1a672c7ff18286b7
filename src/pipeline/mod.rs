//! Job processing pipeline.
//!
//! Every delivery flows through:
//! 1. `TaskPipeline::ingest()`: payload validation and per-user turn ticket
//! 2. `TaskPipeline::run()`: context, inference, validation, append, publish
//! 3. `TaskPipeline::handle()`: ack or reject, plus the outcome log line
//!
//! Jobs of one user run strictly in acceptance order; jobs of different
//! users run concurrently.

pub mod processor;
pub mod sequencer;
pub mod types;

pub use processor::TaskPipeline;
pub use sequencer::{TurnTicket, UserSequencer};
pub use types::{AcceptedJob, Job, JobOutcome, JobResult, JobStage};
