//! The broker transport seam: connection, channel and delivery primitives.
//!
//! The worker only talks to the broker through these traits. `amqp::LapinTransport`
//! is the production implementation.

use crate::error::WorkerError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Lifecycle notifications raised by a connection or a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The broker stopped accepting publishes (resource alarm).
    Blocked { reason: String },
    Unblocked,
    /// The resource closed. `force_exit` asks the worker to terminate the process.
    Closed { force_exit: bool },
    Error { detail: String },
}

/// Callback registered for lifecycle signals. May be invoked from non-Tokio threads.
pub type LifecycleListener = Arc<dyn Fn(LifecycleSignal) + Send + Sync>;

/// Stream of deliveries from one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InFlightMessage, WorkerError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection. The URL already carries the heartbeat parameter.
    async fn connect(&self, url: &Url) -> Result<Arc<dyn BrokerConnection>, WorkerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError>;

    fn on_signal(&self, listener: LifecycleListener);

    async fn close(&self) -> Result<(), WorkerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Bounds the number of unacknowledged deliveries per consumer.
    async fn prefetch(&self, count: u16) -> Result<(), WorkerError>;

    /// Declares a durable topic exchange. Idempotent.
    async fn assert_exchange(&self, exchange: &str) -> Result<(), WorkerError>;

    /// Declares a durable queue. Idempotent, never purges existing messages.
    async fn assert_queue(&self, queue: &str) -> Result<(), WorkerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), WorkerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, WorkerError>;

    fn on_signal(&self, listener: LifecycleListener);

    async fn close(&self) -> Result<(), WorkerError>;
}

/// Settles a single delivery on the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Removes the delivery from the queue for good.
    async fn ack(&self) -> Result<(), WorkerError>;

    /// Rejects the delivery and requeues it so the broker redelivers it.
    async fn nack(&self) -> Result<(), WorkerError>;
}

/// Broker metadata of a delivery, handed to handlers alongside the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub delivery_tag: u64,
    /// True when this is a re-send after a previous nack.
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A delivery that has not been settled yet.
///
/// Settling consumes the message, so nothing can act on it after the ack/nack decision.
pub struct InFlightMessage {
    payload: Vec<u8>,
    info: DeliveryInfo,
    acker: Box<dyn Acknowledge>,
}

impl InFlightMessage {
    pub fn new(payload: Vec<u8>, info: DeliveryInfo, acker: Box<dyn Acknowledge>) -> Self {
        Self { payload, info, acker }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn info(&self) -> &DeliveryInfo {
        &self.info
    }

    pub async fn ack(self) -> Result<(), WorkerError> {
        self.acker.ack().await
    }

    /// Negative acknowledgement with requeue.
    pub async fn nack(self) -> Result<(), WorkerError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for InFlightMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightMessage")
            .field("payload_len", &self.payload.len())
            .field("info", &self.info)
            .finish()
    }
}
