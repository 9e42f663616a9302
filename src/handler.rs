// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Pluggable business logic invoked by the consumption loops. Handlers are
//! registered per queue name in a [`HandlerRegistry`] populated at startup.

use crate::{
    errors::{AmqpError, HandlerError},
    topology::Topology,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

/// Name of the built-in handler logging every message at info level.
pub const GENERIC_HANDLER: &str = "generic";
/// Name of the built-in handler logging every message as a final retry notice.
pub const GENERIC_RETRY_HANDLER: &str = "generic_retry";

/// Processes one message taken from a queue.
///
/// Returning an error makes the consumption loop retry or drop the message
/// depending on the queue's remaining attempts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, routing_key: &str, payload: &Value) -> Result<(), HandlerError>;
}

/// Maps queue names to the handler consuming them.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers `handler` for messages consumed from `queue`.
    pub fn register(mut self, queue: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(queue.to_owned(), handler);
        self
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(queue).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Checks that every consuming queue of the topology has a handler.
    pub fn validate(&self, topology: &Topology) -> Result<(), AmqpError> {
        for queue in topology.consuming_queues() {
            if !self.handlers.contains_key(queue.name()) {
                error!(queue = queue.name(), "no handler registered for consuming queue");
                return Err(AmqpError::MissingHandler(queue.name().to_owned()));
            }
        }

        Ok(())
    }
}

/// Returns the built-in handler registered under `kind`, if any.
pub fn builtin(kind: &str) -> Option<Arc<dyn MessageHandler>> {
    match kind {
        GENERIC_HANDLER => Some(Arc::new(GenericHandler)),
        GENERIC_RETRY_HANDLER => Some(Arc::new(GenericRetryHandler)),
        _ => None,
    }
}

/// Logs each received message.
pub struct GenericHandler;

#[async_trait]
impl MessageHandler for GenericHandler {
    async fn handle(&self, routing_key: &str, payload: &Value) -> Result<(), HandlerError> {
        info!(routing_key, payload = %payload, "received message");
        Ok(())
    }
}

/// Logs each message reaching a retry queue.
pub struct GenericRetryHandler;

#[async_trait]
impl MessageHandler for GenericRetryHandler {
    async fn handle(&self, routing_key: &str, payload: &Value) -> Result<(), HandlerError> {
        warn!(routing_key, payload = %payload, "final retry for message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeDefinition, queue::QueueDefinition};
    use serde_json::json;

    fn topology() -> Topology {
        Topology::new()
            .exchange(ExchangeDefinition::new("tasks").topic())
            .queue(QueueDefinition::new("tasks", "tasks").consume())
            .queue(QueueDefinition::new("tasks-archive", "tasks"))
    }

    #[test]
    fn should_accept_handlers_for_every_consuming_queue() {
        let registry = HandlerRegistry::new().register("tasks", Arc::new(GenericHandler));

        assert_eq!(registry.validate(&topology()), Ok(()));
    }

    #[test]
    fn should_reject_consuming_queue_without_handler() {
        let registry = HandlerRegistry::new().register("tasks-archive", Arc::new(GenericHandler));

        assert_eq!(
            registry.validate(&topology()),
            Err(AmqpError::MissingHandler("tasks".to_owned()))
        );
    }

    #[test]
    fn should_resolve_builtin_handlers_by_name() {
        assert!(builtin(GENERIC_HANDLER).is_some());
        assert!(builtin(GENERIC_RETRY_HANDLER).is_some());
        assert!(builtin("App\\Handlers\\Missing").is_none());
    }

    #[tokio::test]
    async fn should_accept_any_payload_in_generic_handlers() {
        let payload = json!({"id": 42});

        assert_eq!(GenericHandler.handle("task.created", &payload).await, Ok(()));
        assert_eq!(GenericRetryHandler.handle("task.created", &json!({})).await, Ok(()));
    }
}
