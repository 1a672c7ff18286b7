//! Line-delimited JSON transport. One job per input line, one result per
//! output line. With [`LineQueue::stdio`] the worker runs locally without a
//! broker: pipe jobs into stdin, read results from stdout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::QueueError;
use crate::pipeline::types::JobResult;
use crate::queue::{Delivery, DeliveryStream, QueueGateway};

const NAME: &str = "line";

type BoxReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// [`QueueGateway`] over a pair of byte streams.
///
/// Acks and rejects are no-ops beyond logging: a line, once read, is never
/// redelivered.
pub struct LineQueue {
    reader: StdMutex<Option<BoxReader>>,
    writer: Mutex<BoxWriter>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    next_tag: Arc<AtomicU64>,
}

impl LineQueue {
    pub fn new(
        reader: impl AsyncBufRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: StdMutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            reader_task: StdMutex::new(None),
            next_tag: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Jobs from stdin, results to stdout.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

#[async_trait]
impl QueueGateway for LineQueue {
    fn name(&self) -> &str {
        NAME
    }

    async fn consume(&self) -> Result<DeliveryStream, QueueError> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| QueueError::ConsumeFailed {
                name: NAME.to_string(),
                reason: "already consuming".to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let next_tag = self.next_tag.clone();

        let handle = tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = Vec::new();
            loop {
                buf.clear();
                // Raw bytes: invalid UTF-8 is the parser's call, not ours.
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => {
                        tracing::info!("Input closed, no more deliveries");
                        break;
                    }
                    Ok(_) => {
                        let line = buf.trim_ascii();
                        if line.is_empty() {
                            continue;
                        }
                        let tag = next_tag.fetch_add(1, Ordering::SeqCst);
                        if tx.send(Delivery::new(tag, line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Error reading input: {}", e);
                        break;
                    }
                }
            }
        });
        *self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, tag: u64) -> Result<(), QueueError> {
        tracing::trace!(tag, "ack");
        Ok(())
    }

    async fn reject(&self, tag: u64) -> Result<(), QueueError> {
        tracing::debug!(tag, "Delivery rejected; line transport does not redeliver");
        Ok(())
    }

    async fn publish(&self, result: &JobResult) -> Result<(), QueueError> {
        let mut line = serde_json::to_vec(result).map_err(|e| QueueError::PublishFailed {
            name: NAME.to_string(),
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| QueueError::PublishFailed {
                name: NAME.to_string(),
                reason: e.to_string(),
            })?;
        writer.flush().await.map_err(|e| QueueError::PublishFailed {
            name: NAME.to_string(),
            reason: e.to_string(),
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        if let Some(handle) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(|e| QueueError::PublishFailed {
            name: NAME.to_string(),
            reason: format!("shutdown: {e}"),
        })
    }
}
