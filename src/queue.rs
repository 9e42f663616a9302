// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides types for defining RabbitMQ queues, their bindings and
//! their retry policy. A queue with an enabled retry policy is rewired by
//! [`crate::topology::expand`] so that rejected messages travel through a
//! delayed `.retry` companion queue before being redelivered.

use crate::exchange::ExchangeKind;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Max attempts applied to consuming queues that carry no retry policy.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Suffix appended to a queue or exchange name for its generated retry companion.
pub const RETRY_SUFFIX: &str = ".retry";

/// Value of a queue declaration argument (`x-message-ttl`, `x-dead-letter-exchange`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum QueueArgument {
    Int(i64),
    Str(String),
}

impl From<i64> for QueueArgument {
    fn from(value: i64) -> Self {
        QueueArgument::Int(value)
    }
}

impl From<&str> for QueueArgument {
    fn from(value: &str) -> Self {
        QueueArgument::Str(value.to_owned())
    }
}

impl From<String> for QueueArgument {
    fn from(value: String) -> Self {
        QueueArgument::Str(value)
    }
}

/// Delayed retry configuration attached to exactly one queue.
///
/// Unset optional fields fall back to the defaults resolved during expansion:
/// exchange `{bound_exchange}.retry` of kind direct, routing key `{queue}.retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub(crate) enabled: bool,
    pub(crate) max_attempts: u32,
    pub(crate) interval_ms: u64,
    pub(crate) exchange_name: Option<String>,
    pub(crate) exchange_kind: Option<ExchangeKind>,
    pub(crate) durable: bool,
    pub(crate) routing_key: Option<String>,
}

impl RetryPolicy {
    /// Creates an enabled retry policy.
    ///
    /// # Parameters
    /// * `max_attempts` - Number of failures tolerated before a message is dropped
    /// * `interval_ms` - Time in milliseconds a failed message waits before redelivery
    pub fn new(max_attempts: u32, interval_ms: u64) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_attempts,
            interval_ms,
            exchange_name: None,
            exchange_kind: None,
            durable: true,
            routing_key: None,
        }
    }

    /// Keeps the policy around (max attempts still applies) without generating
    /// any dead-letter machinery.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Overrides the name of the generated retry exchange.
    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange_name = Some(name.to_owned());
        self
    }

    /// Overrides the type of the generated retry exchange.
    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    /// Overrides the routing key used to dead-letter into the retry exchange.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Sets the durability of the generated retry exchange and queue.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern. A queue is bound to a single
/// exchange through every key in `routing_keys`, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) exchange: String,
    pub(crate) routing_keys: Vec<String>,
    pub(crate) durable: bool,
    pub(crate) consume: bool,
    pub(crate) arguments: BTreeMap<String, QueueArgument>,
    pub(crate) retry: Option<RetryPolicy>,
}

impl QueueDefinition {
    /// Creates a new durable, non-consuming queue definition bound to `exchange`.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    /// * `exchange` - The exchange the queue is bound to
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str, exchange: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            exchange: exchange.to_owned(),
            routing_keys: vec![],
            durable: true,
            consume: false,
            arguments: BTreeMap::default(),
            retry: None,
        }
    }

    /// Adds a routing key used to bind the queue to its exchange.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }

    /// Sets whether the queue survives broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Marks the queue as one this process consumes from.
    pub fn consume(mut self) -> Self {
        self.consume = true;
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: &str, value: impl Into<QueueArgument>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Attaches a retry policy to the queue.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn should_consume(&self) -> bool {
        self.consume
    }

    pub fn arguments(&self) -> &BTreeMap<String, QueueArgument> {
        &self.arguments
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Whether expansion has to generate dead-letter machinery for this queue.
    pub fn has_retry(&self) -> bool {
        self.retry.as_ref().is_some_and(|r| r.enabled)
    }

    /// Failure budget used by the consumption loop.
    ///
    /// Queues without a retry policy fall back to [`DEFAULT_MAX_ATTEMPTS`].
    pub fn max_attempts(&self) -> u32 {
        self.retry
            .as_ref()
            .map(|r| r.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// Name of the companion retry queue generated for this queue.
    pub fn retry_queue_name(&self) -> String {
        format!("{}{}", self.name, RETRY_SUFFIX)
    }
}
