//! Job queue gateway: inbound deliveries and outbound results.
//!
//! Transports implement [`QueueGateway`]. Deliveries are at-least-once; the
//! pipeline settles every delivery with exactly one `ack` or `reject`.

pub mod line;
pub mod memory;

pub use line::LineQueue;
pub use memory::MemoryQueue;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::QueueError;
use crate::pipeline::types::JobResult;

/// One message handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-assigned tag used to settle the delivery.
    pub tag: u64,
    /// Raw message body, expected to be a JSON job.
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

/// Stream of inbound deliveries. Ends when the transport closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Transport used by the worker to receive jobs and publish results.
#[async_trait]
pub trait QueueGateway: Send + Sync {
    /// Transport name used in logs and errors.
    fn name(&self) -> &str;

    /// Start consuming. May only be called once per gateway.
    async fn consume(&self) -> Result<DeliveryStream, QueueError>;

    /// Settle a delivery as handled; it will not be redelivered.
    async fn ack(&self, tag: u64) -> Result<(), QueueError>;

    /// Settle a delivery as failed without asking for a requeue.
    /// Redelivery or dead-lettering is left to the transport's policy.
    async fn reject(&self, tag: u64) -> Result<(), QueueError>;

    /// Publish a job result on the outbound channel.
    async fn publish(&self, result: &JobResult) -> Result<(), QueueError>;

    /// Stop deliveries and release the connection.
    async fn close(&self) -> Result<(), QueueError>;
}
