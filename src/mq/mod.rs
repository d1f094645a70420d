//! Message broker abstraction.
//!
//! The worker and the RPC client only see [`Broker`] and [`Message`].
//! [`AmqpBroker`] talks to RabbitMQ; tests use an in-memory broker.

pub mod amqp;
#[cfg(test)]
pub(crate) mod memory;
pub mod protocol;

pub use amqp::AmqpBroker;
pub use protocol::{ExecutionRequest, ExecutionResponse};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Content type of every published body.
pub const CONTENT_TYPE: &str = "application/json";

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
}

/// Settles a delivered message with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A delivered message. Settle it with exactly one of the consuming methods.
pub struct Message {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Message {
    pub fn new(
        body: Vec<u8>,
        correlation_id: Option<String>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            body,
            correlation_id,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negative acknowledgment; `requeue` puts it back for redelivery.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("correlation_id", &self.correlation_id)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one queue.
pub type Deliveries = BoxStream<'static, Result<Message>>;

/// A queue broker.
///
/// Implementations must be safe to use from several tasks at once; each
/// `consume` call gets its own delivery channel.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable queue; idempotent.
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Publish to `queue` via the default exchange.
    async fn publish(&self, queue: &str, message: Outgoing) -> Result<()>;

    /// Start consuming `queue` with manual acknowledgment.
    async fn consume(&self, queue: &str) -> Result<Deliveries>;
}
