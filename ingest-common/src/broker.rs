//! # Broker
//!
//! The message broker seen by the publisher and the consumer: one durable direct exchange,
//! durable queues bound to it by routing key, persistent messages and manual acknowledgment.
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Enumeration of errors for broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("no queue is bound to exchange {exchange} with routing key {routing_key}")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },
    #[error("delivery {0} is not outstanding on this channel")]
    UnknownDelivery(DeliveryTag),
    #[error("broker is unavailable: {0}")]
    Unavailable(String),
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Exchange, queue and the routing key binding them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    /// The broker must keep the message across its own restarts.
    Persistent,
}

impl DeliveryMode {
    pub fn is_persistent(&self) -> bool {
        matches!(self, DeliveryMode::Persistent)
    }
}

/// A message on its way to an exchange.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
}

/// Identifies one outstanding delivery on a channel.
/// A requeued message keeps its tag when it is delivered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub i64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message handed to a consumer.
/// The broker owns it until `ack` or `nack` consumes it.
#[derive(Debug)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub content_type: String,
}

/// The publishing side of the broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Declare the exchange and queue and bind them. Declaring twice is a no-op.
    async fn declare(&self, topology: &Topology) -> BrokerResult<()>;

    /// Publish a message, returning only once the broker has durably accepted it.
    async fn publish(&self, message: OutgoingMessage) -> BrokerResult<()>;
}

/// A consuming channel on one queue, with a bounded prefetch window.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Return the next delivery, or `None` when the queue is empty or the prefetch window is full.
    async fn next_delivery(&self) -> BrokerResult<Option<Delivery>>;

    async fn ack(&self, delivery: Delivery) -> BrokerResult<()>;

    /// Negatively acknowledge. With `requeue` the message goes back to the queue marked as
    /// redelivered, otherwise it is dead-lettered.
    async fn nack(&self, delivery: Delivery, requeue: bool) -> BrokerResult<()>;

    /// Return deliveries left unacknowledged by a previous session of this consumer to the queue.
    async fn recover(&self) -> BrokerResult<u64>;
}
