//! Stub collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use chat_worker::config::ContextBounds;
use chat_worker::error::{ContextStoreError, InferenceError};
use chat_worker::llm::{Completion, InferenceClient};
use chat_worker::store::{ContextStore, MemoryContextStore, Transcript, Turn};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How the stub answers a given query.
#[derive(Clone)]
pub enum Reply {
    Text(String),
    NonText(serde_json::Value),
    TransportError,
    /// Sleep, then answer with the text.
    Delayed(Duration, String),
    /// Signal `started`, then wait for `release` before answering.
    Gated(String),
    Panic,
}

/// Inference stub keyed by query text. Unknown queries echo back.
#[derive(Default)]
pub struct StubInference {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(String, String, usize)>>,
    pub started: Notify,
    pub release: Notify,
}

impl StubInference {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, query: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(query.to_string(), reply);
    }

    /// `(user_id, query, context_turns)` for every call, in call order.
    pub fn calls(&self) -> Vec<(String, String, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceClient for StubInference {
    fn name(&self) -> &str {
        "stub"
    }

    async fn complete(
        &self,
        user_id: &str,
        input: &str,
        context: &Transcript,
    ) -> Result<Completion, InferenceError> {
        self.calls
            .lock()
            .unwrap()
            .push((user_id.to_string(), input.to_string(), context.len()));
        let reply = self.replies.lock().unwrap().get(input).cloned();

        match reply {
            None => Ok(Completion::Text(format!("re: {input}"))),
            Some(Reply::Text(text)) => Ok(Completion::Text(text)),
            Some(Reply::NonText(value)) => Ok(Completion::NonText(value)),
            Some(Reply::TransportError) => Err(InferenceError::RequestFailed {
                provider: "stub".to_string(),
                reason: "connection reset".to_string(),
            }),
            Some(Reply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(Completion::Text(text))
            }
            Some(Reply::Gated(text)) => {
                self.started.notify_one();
                self.release.notified().await;
                Ok(Completion::Text(text))
            }
            Some(Reply::Panic) => panic!("stub inference panicked on {input}"),
        }
    }
}

/// Memory store that records appends and can be told to fail or stall.
pub struct RecordingStore {
    inner: MemoryContextStore,
    appends: Mutex<Vec<(String, Turn)>>,
    fail_reads: AtomicBool,
    fail_appends: AtomicBool,
    stall_reads: AtomicBool,
    stall_appends: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Self::with_bounds(ContextBounds::default())
    }

    pub fn with_bounds(bounds: ContextBounds) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryContextStore::new(bounds),
            appends: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
            fail_appends: AtomicBool::new(false),
            stall_reads: AtomicBool::new(false),
            stall_appends: AtomicBool::new(false),
        })
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Reads never complete.
    pub fn stall_reads(&self, stall: bool) {
        self.stall_reads.store(stall, Ordering::SeqCst);
    }

    /// Appends never complete.
    pub fn stall_appends(&self, stall: bool) {
        self.stall_appends.store(stall, Ordering::SeqCst);
    }

    /// Successful appends in call order.
    pub fn appends(&self) -> Vec<(String, Turn)> {
        self.appends.lock().unwrap().clone()
    }

    /// Queries appended for one user, in call order.
    pub fn inputs_for(&self, user_id: &str) -> Vec<String> {
        self.appends()
            .into_iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, turn)| turn.input)
            .collect()
    }
}

#[async_trait]
impl ContextStore for RecordingStore {
    async fn get(&self, user_id: &str) -> Result<Transcript, ContextStoreError> {
        if self.stall_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ContextStoreError::Query("read disabled".to_string()));
        }
        self.inner.get(user_id).await
    }

    async fn append(&self, user_id: &str, turn: &Turn) -> Result<(), ContextStoreError> {
        if self.stall_appends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(ContextStoreError::Query("append disabled".to_string()));
        }
        self.inner.append(user_id, turn).await?;
        self.appends
            .lock()
            .unwrap()
            .push((user_id.to_string(), turn.clone()));
        Ok(())
    }
}
