//! In-process queue gateway backed by a tokio channel.
//!
//! Used by tests and by embedders that feed jobs from inside the same
//! process. Every ack, reject and published result is recorded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::QueueError;
use crate::pipeline::types::JobResult;
use crate::queue::{Delivery, DeliveryStream, QueueGateway};

const NAME: &str = "memory";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel-backed [`QueueGateway`].
pub struct MemoryQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    next_tag: AtomicU64,
    acked: Mutex<Vec<u64>>,
    rejected: Mutex<Vec<u64>>,
    published: Mutex<Vec<JobResult>>,
    fail_publish: AtomicBool,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            next_tag: AtomicU64::new(1),
            acked: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a raw payload. Returns its delivery tag, or `None` once the
    /// queue has been finished or closed.
    pub fn push(&self, payload: impl Into<Vec<u8>>) -> Option<u64> {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let sender = lock(&self.sender);
        sender
            .as_ref()?
            .send(Delivery::new(tag, payload))
            .ok()
            .map(|()| tag)
    }

    /// Enqueue a JSON job `{userId, query}`.
    pub fn push_job(&self, user_id: &str, query: &str) -> Option<u64> {
        let payload = serde_json::json!({ "userId": user_id, "query": query });
        self.push(payload.to_string())
    }

    /// End the delivery stream once already-queued deliveries are consumed.
    pub fn finish(&self) {
        lock(&self.sender).take();
    }

    /// Make every subsequent `publish` fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn acked(&self) -> Vec<u64> {
        lock(&self.acked).clone()
    }

    pub fn rejected(&self) -> Vec<u64> {
        lock(&self.rejected).clone()
    }

    pub fn published(&self) -> Vec<JobResult> {
        lock(&self.published).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueGateway for MemoryQueue {
    fn name(&self) -> &str {
        NAME
    }

    async fn consume(&self) -> Result<DeliveryStream, QueueError> {
        let receiver = lock(&self.receiver)
            .take()
            .ok_or_else(|| QueueError::ConsumeFailed {
                name: NAME.to_string(),
                reason: "already consuming".to_string(),
            })?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn ack(&self, tag: u64) -> Result<(), QueueError> {
        lock(&self.acked).push(tag);
        Ok(())
    }

    async fn reject(&self, tag: u64) -> Result<(), QueueError> {
        lock(&self.rejected).push(tag);
        Ok(())
    }

    async fn publish(&self, result: &JobResult) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed {
                name: NAME.to_string(),
            });
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(QueueError::PublishFailed {
                name: NAME.to_string(),
                reason: "publishing disabled".to_string(),
            });
        }
        lock(&self.published).push(result.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.sender).take();
        Ok(())
    }
}
