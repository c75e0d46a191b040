//! # Broker Topology
//!
//! A fanout exchange bound to one durable queue, plus a durable dead-letter
//! queue for messages that exhausted their retries.
//!
//! ## Architecture
//!
//! - **BrokerConnector**: opens a connection and channel under a deadline
//! - **BrokerChannel**: topology assertion, publish, prefetch, consume, close
//! - **Subscription**: stream of deliveries from one queue
//! - **Delivery**: message body plus its ack/nack handle
//!
//! Two implementations: `AmqpConnector` (AMQP 0-9-1) and `MemoryBroker`
//! (in-process, used for tests and local dry runs).

mod amqp;
mod errors;
mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use amqp::AmqpConnector;
pub use errors::{BrokerError, BrokerResult};
pub use memory::MemoryBroker;

/// Routing key used for the fanout binding and for exchange publishes
pub const FANOUT_ROUTING_KEY: &str = "";

/// Default (nameless) exchange; routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

/// Exchange and queue names both sides agree on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Fanout exchange the publisher writes to
    pub exchange: String,

    /// Durable queue bound to the exchange
    pub queue: String,

    /// Durable queue for messages that exhausted their retries
    pub dead_letter_queue: String,
}

impl Topology {
    /// Create a topology, deriving the dead-letter queue name from the queue
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            exchange: exchange.into(),
            dead_letter_queue: format!("{}.dead-letter", queue),
            queue,
        }
    }

    /// Override the dead-letter queue name
    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = name.into();
        self
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (dead-letter: {})",
            self.exchange, self.queue, self.dead_letter_queue
        )
    }
}

/// Opens broker channels
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a connection and a channel on it.
    ///
    /// Must fail instead of hanging once the connect deadline passes.
    async fn open(&self) -> BrokerResult<Box<dyn BrokerChannel>>;
}

/// One channel on one connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare exchange, queue, dead-letter queue and the empty-key binding.
    ///
    /// Idempotent: asserting an existing topology changes nothing.
    async fn assert_topology(&self, topology: &Topology) -> BrokerResult<()>;

    /// Publish one persistent message. Does not wait for broker confirmation.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerResult<()>;

    /// Cap the number of unacknowledged deliveries on this channel
    async fn set_prefetch(&self, prefetch: u16) -> BrokerResult<()>;

    /// Start consuming from a queue
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> BrokerResult<Box<dyn Subscription>>;

    /// Close the channel and its connection.
    ///
    /// Unacknowledged deliveries go back to their queue.
    async fn close(&self) -> BrokerResult<()>;
}

/// Deliveries from one queue
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery; `None` once the channel is closed
    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>>;
}

/// Settles one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgement; the broker forgets the message
    async fn ack(&self) -> BrokerResult<()>;

    /// Negative acknowledgement; `requeue` returns it to the queue, otherwise it is dropped
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// A message handed to the consumer
pub struct Delivery {
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wrap a body and its acknowledger
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    /// Raw message body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker delivered this message before
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_derives_dead_letter_queue() {
        let topology = Topology::new("gate.mutations", "gate.mirror");
        assert_eq!(topology.dead_letter_queue, "gate.mirror.dead-letter");

        let topology = topology.with_dead_letter_queue("gate.dlq");
        assert_eq!(topology.dead_letter_queue, "gate.dlq");
    }
}
