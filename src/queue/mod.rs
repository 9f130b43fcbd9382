// src/queue/mod.rs
// Queue client abstraction shared by the producer and the consumer.

pub mod amqp;
pub mod errors;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

pub use amqp::AmqpQueueClient;
pub use errors::{QueueError, Result};
pub use memory::{MemoryBroker, MemoryQueueClient};

/// Stream of deliveries for one subscription. It ends when the channel
/// closes; an `Err` item means the channel failed.
pub type Subscription = BoxStream<'static, Result<IncomingMessage>>;

/// Owns the connection and channel to the broker and makes sure the target
/// queue exists before anything is published or consumed.
#[async_trait]
pub trait QueueClient: Send {
    /// Connects, opens a channel and declares the queue. A no-op when the
    /// channel is already open.
    async fn ensure_ready(&mut self) -> Result<()>;

    /// Publishes a persistent JSON body to the queue.
    async fn publish(&mut self, body: &[u8]) -> Result<()>;

    /// Starts a manual-ack subscription on the queue.
    async fn subscribe(&mut self, consumer_tag: &str) -> Result<Subscription>;

    /// Drops the current channel so the next `ensure_ready` opens a fresh one.
    fn reset(&mut self);

    /// Closes the channel. Deliveries still buffered on it go back to the queue.
    async fn close(&mut self) -> Result<()>;

    fn queue_name(&self) -> &str;
}

/// Header carrying how many times the consumer has sent a message back to
/// the queue for another try. Broker redeliveries leave it untouched.
pub const RETRY_ATTEMPTS_HEADER: &str = "x-retry-attempts";

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;

    /// Publishes `body` again at the back of the queue with
    /// [`RETRY_ATTEMPTS_HEADER`] set to `retry_attempts`, then acks this
    /// delivery.
    async fn republish(&self, body: &[u8], retry_attempts: u32) -> Result<()>;
}

pub struct IncomingMessage {
    pub body: Vec<u8>,
    /// Set by the broker when this message was delivered before.
    pub redelivered: bool,
    /// Value of [`RETRY_ATTEMPTS_HEADER`], 0 when absent.
    pub retry_attempts: u32,
    acker: Box<dyn Acknowledger>,
}

impl IncomingMessage {
    pub fn new(
        body: Vec<u8>,
        redelivered: bool,
        retry_attempts: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            redelivered,
            retry_attempts,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }

    /// Sends the message to the back of the queue as attempt `retry_attempts`.
    pub async fn retry_later(&self, retry_attempts: u32) -> Result<()> {
        self.acker.republish(&self.body, retry_attempts).await
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("retry_attempts", &self.retry_attempts)
            .finish()
    }
}

/// Name of the queue that rejected messages are dead-lettered to.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{}.dead-letter", queue)
}
