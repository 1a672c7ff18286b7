//! In-process context store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::ContextBounds;
use crate::error::ContextStoreError;
use crate::store::traits::{ContextStore, Transcript, Turn};

/// Context store kept in process memory.
///
/// Same bounding policy as the durable store, so memory grows with the
/// number of users rather than with total traffic.
pub struct MemoryContextStore {
    transcripts: RwLock<HashMap<String, Transcript>>,
    bounds: ContextBounds,
}

impl MemoryContextStore {
    pub fn new(bounds: ContextBounds) -> Self {
        Self {
            transcripts: RwLock::new(HashMap::new()),
            bounds,
        }
    }

    /// Number of users with stored history.
    pub async fn user_count(&self) -> usize {
        self.transcripts.read().await.len()
    }
}

impl Default for MemoryContextStore {
    fn default() -> Self {
        Self::new(ContextBounds::default())
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get(&self, user_id: &str) -> Result<Transcript, ContextStoreError> {
        Ok(self
            .transcripts
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, user_id: &str, turn: &Turn) -> Result<(), ContextStoreError> {
        let mut transcripts = self.transcripts.write().await;
        let transcript = transcripts.entry(user_id.to_string()).or_default();
        let evicted = transcript.push_bounded(turn.clone(), &self.bounds);
        if evicted > 0 {
            debug!(user_id, evicted, "Evicted oldest turns");
        }
        Ok(())
    }
}
