// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing persistent JSON messages
//! to exchanges of the expanded topology, propagating the OpenTelemetry
//! context in the message headers.

use crate::{broker::Broker, errors::AmqpError, otel, topology::Topology};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Publishes messages to exchanges known by the topology.
///
/// The publisher should be given a broker on a channel of its own so that
/// publishing never interleaves with the consumers' channel state.
pub struct RabbitMQPublisher {
    broker: Arc<dyn Broker>,
    topology: Arc<Topology>,
}

impl RabbitMQPublisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `broker` - Gateway dedicated to publishing
    /// * `topology` - The expanded topology
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(broker: Arc<dyn Broker>, topology: Arc<Topology>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { broker, topology })
    }

    /// Publishes `payload` as JSON to `exchange` with `routing_key`.
    ///
    /// Fails with [`AmqpError::ExchangeNotFound`] before any broker call when
    /// the exchange is not part of the topology. Otherwise the exchange is
    /// declared (a no-op when it already exists) and the message is published
    /// as persistent.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let Some(def) = self.topology.get_exchange(exchange) else {
            error!(exchange, "publishing to an exchange absent from the topology");
            return Err(AmqpError::ExchangeNotFound(exchange.to_owned()));
        };

        let data = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        let mut headers = BTreeMap::new();
        otel::inject(&Context::current(), &mut headers);

        self.broker.declare_exchange(def).await?;
        self.broker
            .publish(exchange, routing_key, &data, &headers, true)
            .await?;

        debug!(exchange, routing_key, "message published");
        Ok(())
    }
}
