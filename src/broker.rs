// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Gateway
//!
//! Capability traits over the message broker transport. The topology installer,
//! the dispatcher and the publisher only ever talk to a [`Broker`]; the lapin
//! backed implementation lives in [`crate::amqp`].

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt};

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries for one consumer. The stream ends when the broker
/// reports the consumer as no longer active.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// One prior dead-lettering event recorded by the broker on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub count: u64,
}

impl DeathRecord {
    pub fn new(queue: &str, count: u64) -> Self {
        DeathRecord {
            queue: queue.to_owned(),
            count,
        }
    }
}

/// Settles a single delivery with the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Removes the delivery from its queue.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery. With `requeue` unset the broker dead-letters it
    /// according to the queue's `x-dead-letter-*` arguments.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message handed to a consumption loop, decoded from the wire by the gateway.
pub struct InboundMessage {
    pub routing_key: String,
    pub data: Vec<u8>,
    /// String-valued headers, used for trace context propagation.
    pub headers: BTreeMap<String, String>,
    /// Death history, oldest dead-lettering first as reported by the broker.
    pub deaths: Vec<DeathRecord>,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("routing_key", &self.routing_key)
            .field("data", &self.data.len())
            .field("deaths", &self.deaths)
            .finish_non_exhaustive()
    }
}

/// Transport operations needed to realize a topology, consume from it and
/// publish into it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares an exchange. Declaring an identical exchange twice is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue with its arguments.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Binds `queue` to `exchange` with `routing_key`.
    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError>;

    /// Sets the number of unacknowledged messages a consumer may hold.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Registers a consumer on `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError>;

    /// Publishes a payload to `exchange` with `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
        persistent: bool,
    ) -> Result<(), AmqpError>;
}
