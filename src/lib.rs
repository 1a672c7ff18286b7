//! Chat worker: queue-driven conversational replies with per-user memory.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod worker;
