// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Retry Consumer
//!
//! This module provides the error taxonomy shared by the topology expander,
//! the broker gateway, the consumption loops and the publisher.
//! Configuration errors are fatal at setup, transport errors are fatal to the
//! affected consumption loop, and handler failures never leave the loop.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// The first group of variants are configuration errors detected before any
/// broker call is made. The remaining variants wrap transport failures and
/// carry the broker's own error text.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// A queue is bound to an exchange missing from the topology
    #[error("queue `{queue}` references unknown exchange `{exchange}`")]
    UnknownExchange { queue: String, exchange: String },

    /// A generated retry queue clashes with a queue already in the topology
    #[error("retry queue `{0}` collides with an existing queue")]
    QueueNameCollision(String),

    /// A generated retry exchange clashes with a differently configured exchange
    #[error("retry exchange `{0}` conflicts with an existing exchange definition")]
    ExchangeConflict(String),

    /// A consuming queue has no handler registered for it
    #[error("no handler registered for consuming queue `{0}`")]
    MissingHandler(String),

    /// Publishing targeted an exchange that is not part of the topology
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error reported by an active consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),
}

impl AmqpError {
    /// Whether the error was detected while validating configuration,
    /// before any broker interaction.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AmqpError::UnknownExchange { .. }
                | AmqpError::QueueNameCollision(_)
                | AmqpError::ExchangeConflict(_)
                | AmqpError::MissingHandler(_)
                | AmqpError::ExchangeNotFound(_)
        )
    }
}

/// Failure signalled by a message handler.
///
/// The consumption loop only cares that the handler failed; the reason is
/// kept for logging and tracing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_configuration_errors() {
        assert!(AmqpError::ExchangeNotFound("x".into()).is_configuration());
        assert!(AmqpError::QueueNameCollision("q.retry".into()).is_configuration());
        assert!(!AmqpError::AckMessageError("closed".into()).is_configuration());
    }

    #[test]
    fn should_name_both_sides_of_a_failed_binding() {
        let err = AmqpError::BindingExchangeToQueueError("orders".into(), "orders-q".into());
        assert_eq!(
            err.to_string(),
            "failure to bind queue `orders-q` to exchange `orders`"
        );
    }
}
