//! `ContextStore` trait: the narrow interface the pipeline uses for
//! per-user conversation history.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ContextBounds;
use crate::error::ContextStoreError;

/// One prompt/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub input: String,
    pub response: String,
}

impl Turn {
    pub fn new(input: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            response: response.into(),
        }
    }

    /// Characters counted against [`ContextBounds::max_chars`].
    pub fn char_len(&self) -> usize {
        self.input.chars().count() + self.response.chars().count()
    }
}

/// Ordered conversation history for one user, oldest turn first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    turns: VecDeque<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transcript from turns in chronological order.
    pub fn from_turns(turns: impl IntoIterator<Item = Turn>) -> Self {
        Self {
            turns: turns.into_iter().collect(),
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Total characters across all turns.
    pub fn char_len(&self) -> usize {
        self.turns.iter().map(Turn::char_len).sum()
    }

    /// Check whether the transcript satisfies `bounds`.
    pub fn fits(&self, bounds: &ContextBounds) -> bool {
        self.turns.len() <= bounds.max_turns && self.char_len() <= bounds.max_chars
    }

    /// Append a turn, then evict from the front until `bounds` hold.
    ///
    /// Returns the number of evicted turns. A turn that alone exceeds
    /// `max_chars` is evicted as well.
    pub fn push_bounded(&mut self, turn: Turn, bounds: &ContextBounds) -> usize {
        self.turns.push_back(turn);
        self.evict_to(bounds)
    }

    /// Drop oldest turns until `bounds` hold. Returns how many were dropped.
    pub fn evict_to(&mut self, bounds: &ContextBounds) -> usize {
        let mut chars = self.char_len();
        let mut evicted = 0;
        while self.turns.len() > bounds.max_turns || chars > bounds.max_chars {
            match self.turns.pop_front() {
                Some(oldest) => {
                    chars -= oldest.char_len();
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// Per-user conversation history store.
///
/// Implementations enforce their [`ContextBounds`] on every append, so a
/// transcript returned by [`get`](ContextStore::get) never exceeds them.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Load the transcript for `user_id`. Unknown users get an empty one.
    async fn get(&self, user_id: &str) -> Result<Transcript, ContextStoreError>;

    /// Append one validated turn, evicting the oldest turns past the bounds.
    ///
    /// Not idempotent: calling it twice stores the turn twice.
    async fn append(&self, user_id: &str, turn: &Turn) -> Result<(), ContextStoreError>;
}
