// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module runs one consumption loop per consuming queue of an expanded
//! topology. Setup declares the whole topology and sets the prefetch before any
//! consumer is registered. Each loop runs in its own task so a slow handler
//! never stalls other queues, and processes a single delivery at a time.

use crate::{
    broker::{Broker, DeliveryStream},
    consumer::consume,
    errors::AmqpError,
    handler::{HandlerRegistry, MessageHandler},
    queue::QueueDefinition,
    shutdown::ShutdownSignal,
    topology::{Topology, CONSUMER_PREFETCH},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Dispatches deliveries of every consuming queue to its registered handler.
pub struct RabbitMQDispatcher {
    broker: Arc<dyn Broker>,
    topology: Arc<Topology>,
    handlers: HandlerRegistry,
}

impl RabbitMQDispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Parameters
    /// * `broker` - Gateway used for declarations and consumers
    /// * `topology` - The expanded topology
    /// * `handlers` - Handlers keyed by queue name
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: Arc<Topology>,
        handlers: HandlerRegistry,
    ) -> Self {
        RabbitMQDispatcher {
            broker,
            topology,
            handlers,
        }
    }

    /// Validates the handler registry, installs the topology and sets the
    /// consumer prefetch.
    pub async fn setup(&self) -> Result<(), AmqpError> {
        self.handlers.validate(&self.topology)?;
        self.topology.install(self.broker.as_ref()).await?;
        self.broker.set_prefetch(CONSUMER_PREFETCH).await?;

        info!(prefetch = CONSUMER_PREFETCH, "topology installed");
        Ok(())
    }

    /// Consumes every consuming queue until `shutdown` fires or every broker
    /// consumer ends.
    ///
    /// A transport error in any loop stops the dispatcher and is returned;
    /// the remaining loops are aborted and their unsettled deliveries are left
    /// to the broker.
    pub async fn consume_blocking(&self, shutdown: ShutdownSignal) -> Result<(), AmqpError> {
        let mut loops = JoinSet::new();

        for queue in self.topology.consuming_queues() {
            let deliveries = self.broker.consume(&queue.name).await?;

            info!(
                queue = queue.name,
                max_attempts = queue.max_attempts(),
                "listening on queue"
            );

            loops.spawn(consume_queue(
                queue.clone(),
                self.handlers.get(&queue.name),
                deliveries,
                shutdown.clone(),
            ));
        }

        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = err.to_string(), "consumer stopped on broker error");
                    return Err(err);
                }
                Err(err) => {
                    error!(error = err.to_string(), "consumer task failure");
                    return Err(AmqpError::ConsumerError(err.to_string()));
                }
            }
        }

        info!("all consumers stopped");
        Ok(())
    }
}

/// Consumption loop of a single queue.
///
/// Shutdown is only observed between deliveries, so a delivery handed to
/// the handler is always settled before the loop exits.
async fn consume_queue(
    queue: QueueDefinition,
    handler: Option<Arc<dyn MessageHandler>>,
    mut deliveries: DeliveryStream,
    mut shutdown: ShutdownSignal,
) -> Result<(), AmqpError> {
    let tracer = global::tracer("amqp consumer");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.wait() => {
                info!(queue = queue.name, "shutdown requested, consumer stopped");
                return Ok(());
            }

            next = deliveries.next() => match next {
                Some(Ok(msg)) => {
                    consume(&tracer, msg, &queue, handler.as_ref()).await?;
                }
                Some(Err(err)) => {
                    error!(queue = queue.name, error = err.to_string(), "errors consume msg");
                    return Err(err);
                }
                None => {
                    info!(queue = queue.name, "consumer no longer active");
                    return Ok(());
                }
            },
        }
    }
}
