//! Conversation context persistence: per-user bounded transcripts.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlContextStore;
pub use memory::MemoryContextStore;
pub use traits::{ContextStore, Transcript, Turn};
