// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module holds the complete set of exchanges and queues used by the
//! process, the expansion that turns queues carrying a retry policy into the
//! dead-letter loop implementing delayed retries, and the installation of the
//! resulting topology on the broker.
//!
//! For a queue `q` bound to exchange `E` with retry enabled, expansion produces:
//! - an exchange `E.retry` (direct unless overridden)
//! - `x-dead-letter-exchange = E.retry` and `x-dead-letter-routing-key = q.retry`
//!   on `q`, so a rejected message goes to the retry exchange
//! - a queue `q.retry` bound to `E.retry`, with `x-message-ttl = interval` and a
//!   dead-letter target pointing back to `E` with the first routing key of `q`,
//!   so an expired message is redelivered to `q`

use crate::{
    broker::Broker,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueArgument, QueueDefinition, RETRY_SUFFIX},
};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Prefetch applied before any consumer starts.
pub const CONSUMER_PREFETCH: u16 = 1;

/// Exchanges and queues keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchanges: BTreeMap<String, ExchangeDefinition>,
    pub(crate) queues: BTreeMap<String, QueueDefinition>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition, replacing any exchange of the same name.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.insert(def.name.clone(), def);
        self
    }

    /// Adds a queue definition, replacing any queue of the same name.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.insert(def.name.clone(), def);
        self
    }

    pub fn get_exchange(&self, name: &str) -> Option<&ExchangeDefinition> {
        self.exchanges.get(name)
    }

    pub fn get_queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.get(name)
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &ExchangeDefinition> {
        self.exchanges.values()
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueDefinition> {
        self.queues.values()
    }

    /// Queues this process consumes from.
    pub fn consuming_queues(&self) -> impl Iterator<Item = &QueueDefinition> {
        self.queues.values().filter(|q| q.consume)
    }

    /// Checks that every queue is bound to an exchange of the topology.
    pub fn validate(&self) -> Result<(), AmqpError> {
        for queue in self.queues.values() {
            if !self.exchanges.contains_key(&queue.exchange) {
                return Err(AmqpError::UnknownExchange {
                    queue: queue.name.clone(),
                    exchange: queue.exchange.clone(),
                });
            }
        }

        Ok(())
    }

    /// Installs the topology on the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all exchanges
    /// 2. Declares all queues with their arguments
    /// 3. Binds every queue to its exchange with each of its routing keys
    pub async fn install(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        self.install_exchanges(broker).await?;
        self.install_queues(broker).await?;
        self.binding_queues(broker).await
    }

    async fn install_exchanges(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        for exch in self.exchanges.values() {
            debug!(exchange = exch.name, kind = %exch.kind, "declaring exchange");

            if let Err(err) = broker.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    exchange = exch.name,
                    "error to declare the exchange"
                );
                return Err(err);
            }

            info!(exchange = exch.name, "exchange declared");
        }

        Ok(())
    }

    async fn install_queues(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        for queue in self.queues.values() {
            debug!(queue = queue.name, "declaring queue");

            if let Err(err) = broker.declare_queue(queue).await {
                error!(
                    error = err.to_string(),
                    queue = queue.name,
                    "error to declare the queue"
                );
                return Err(err);
            }

            info!(queue = queue.name, "queue declared");
        }

        Ok(())
    }

    async fn binding_queues(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        for queue in self.queues.values() {
            for key in &queue.routing_keys {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    queue.name, queue.exchange, key
                );

                if let Err(err) = broker.bind(&queue.name, &queue.exchange, key).await {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    return Err(err);
                }
            }

            info!(
                queue = queue.name,
                exchange = queue.exchange,
                keys = queue.routing_keys.join(", "),
                "queue bound"
            );
        }

        Ok(())
    }
}

/// Expands every queue with an enabled retry policy into its dead-letter loop.
///
/// The base topology is left untouched and queues without an enabled retry
/// policy pass through unchanged. Fails when a generated retry queue collides
/// with an existing queue, when a generated retry exchange conflicts with an
/// exchange configured differently, or when the result references an
/// exchange it does not define.
pub fn expand(base: &Topology) -> Result<Topology, AmqpError> {
    let mut expanded = base.clone();

    for queue in base.queues.values() {
        let Some(retry) = queue.retry.as_ref().filter(|r| r.enabled) else {
            continue;
        };

        let dlx_exchange = retry
            .exchange_name
            .clone()
            .unwrap_or_else(|| format!("{}{}", queue.exchange, RETRY_SUFFIX));
        let dlx_routing_key = retry
            .routing_key
            .clone()
            .unwrap_or_else(|| queue.retry_queue_name());

        let exchange_def = ExchangeDefinition::new(&dlx_exchange)
            .kind(retry.exchange_kind.unwrap_or(ExchangeKind::Direct))
            .durable(retry.durable);
        merge_exchange(&mut expanded, exchange_def)?;

        if let Some(main) = expanded.queues.get_mut(&queue.name) {
            main.arguments.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                QueueArgument::from(dlx_exchange.as_str()),
            );
            main.arguments.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                QueueArgument::from(dlx_routing_key.as_str()),
            );
        }

        let retry_name = queue.retry_queue_name();
        if expanded.queues.contains_key(&retry_name) {
            error!(queue = retry_name, "retry queue name already in use");
            return Err(AmqpError::QueueNameCollision(retry_name));
        }

        let back_routing_key = queue.routing_keys.first().cloned().unwrap_or_default();
        let ttl = i64::try_from(retry.interval_ms).unwrap_or(i64::MAX);

        let retry_queue = QueueDefinition::new(&retry_name, &dlx_exchange)
            .routing_key(&dlx_routing_key)
            .durable(retry.durable)
            .consume()
            .argument(AMQP_HEADERS_MESSAGE_TTL, ttl)
            .argument(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, queue.exchange.as_str())
            .argument(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, back_routing_key);

        debug!(
            queue = queue.name,
            retry_queue = retry_name,
            retry_exchange = dlx_exchange,
            "retry loop generated"
        );
        expanded.queues.insert(retry_name, retry_queue);
    }

    expanded.validate()?;

    Ok(expanded)
}

/// Inserts a generated retry exchange. Several queues bound to the same
/// exchange share one retry exchange, so an identical definition is accepted.
fn merge_exchange(topology: &mut Topology, def: ExchangeDefinition) -> Result<(), AmqpError> {
    match topology.exchanges.get(&def.name) {
        Some(existing) if *existing != def => {
            error!(exchange = def.name, "retry exchange conflicts with configuration");
            Err(AmqpError::ExchangeConflict(def.name))
        }
        Some(_) => Ok(()),
        None => {
            topology.exchanges.insert(def.name.clone(), def);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBroker, queue::RetryPolicy};
    use mockall::Sequence;

    fn orders_topology() -> Topology {
        Topology::new()
            .exchange(ExchangeDefinition::new("orders").topic())
            .queue(
                QueueDefinition::new("orders", "orders")
                    .routing_key("order.created")
                    .consume()
                    .with_retry(RetryPolicy::new(5, 15000)),
            )
    }

    fn str_arg(value: &str) -> QueueArgument {
        QueueArgument::Str(value.to_owned())
    }

    #[test]
    fn should_expand_orders_scenario() {
        let expanded = expand(&orders_topology()).unwrap();

        let dlx = expanded.get_exchange("orders.retry").unwrap();
        assert_eq!(dlx.exchange_kind(), ExchangeKind::Direct);
        assert!(dlx.is_durable());

        let retry = expanded.get_queue("orders.retry").unwrap();
        assert_eq!(retry.exchange(), "orders.retry");
        assert_eq!(retry.routing_keys(), ["orders.retry".to_owned()]);
        assert!(retry.should_consume());
        assert_eq!(
            retry.arguments(),
            &BTreeMap::from([
                (AMQP_HEADERS_MESSAGE_TTL.to_owned(), QueueArgument::Int(15000)),
                (AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(), str_arg("orders")),
                (AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(), str_arg("order.created")),
            ])
        );

        let main = expanded.get_queue("orders").unwrap();
        assert_eq!(main.arguments()[AMQP_HEADERS_DEAD_LETTER_EXCHANGE], str_arg("orders.retry"));
        assert_eq!(main.arguments()[AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY], str_arg("orders.retry"));
    }

    #[test]
    fn should_route_an_expired_retry_back_to_the_original_binding() {
        let expanded = expand(&orders_topology()).unwrap();
        let main = expanded.get_queue("orders").unwrap();

        // rejected from `orders`: lands in the retry exchange with the dlx key
        let Some(QueueArgument::Str(dlx_exchange)) = main.arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE) else {
            panic!("missing dead letter exchange");
        };
        let Some(QueueArgument::Str(dlx_key)) = main.arguments().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY) else {
            panic!("missing dead letter routing key");
        };

        // the retry queue is the one bound there with that key
        let retry = expanded
            .queues()
            .find(|q| q.exchange() == dlx_exchange && q.routing_keys().contains(dlx_key))
            .unwrap();
        assert!(expanded.get_exchange(dlx_exchange).is_some());

        // expired from the retry queue: back to the original exchange and key
        assert_eq!(retry.arguments()[AMQP_HEADERS_DEAD_LETTER_EXCHANGE], str_arg(main.exchange()));
        let Some(QueueArgument::Str(back_key)) = retry.arguments().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY) else {
            panic!("missing back routing key");
        };
        assert!(main.routing_keys().contains(back_key));
    }

    #[test]
    fn should_leave_queues_without_retry_unchanged() {
        let base = Topology::new()
            .exchange(ExchangeDefinition::new("audit").fanout())
            .queue(QueueDefinition::new("audit", "audit").argument("x-max-length", 10))
            .queue(
                QueueDefinition::new("audit-disabled", "audit")
                    .routing_key("a")
                    .with_retry(RetryPolicy::new(2, 100).disabled()),
            );

        let expanded = expand(&base).unwrap();

        assert_eq!(expanded, base);
    }

    #[test]
    fn should_use_empty_back_routing_key_without_routing_keys() {
        let base = Topology::new()
            .exchange(ExchangeDefinition::new("events").fanout())
            .queue(QueueDefinition::new("events", "events").with_retry(RetryPolicy::new(1, 500)));

        let expanded = expand(&base).unwrap();

        let retry = expanded.get_queue("events.retry").unwrap();
        assert_eq!(retry.arguments()[AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY], str_arg(""));
    }

    #[test]
    fn should_honor_retry_overrides() {
        let base = Topology::new()
            .exchange(ExchangeDefinition::new("billing").topic())
            .queue(
                QueueDefinition::new("invoices", "billing")
                    .routing_key("invoice.*")
                    .with_retry(
                        RetryPolicy::new(3, 2000)
                            .exchange("billing-delay")
                            .exchange_kind(ExchangeKind::Topic)
                            .routing_key("invoices.delayed")
                            .durable(false),
                    ),
            );

        let expanded = expand(&base).unwrap();

        let dlx = expanded.get_exchange("billing-delay").unwrap();
        assert_eq!(dlx.exchange_kind(), ExchangeKind::Topic);
        assert!(!dlx.is_durable());

        let retry = expanded.get_queue("invoices.retry").unwrap();
        assert_eq!(retry.exchange(), "billing-delay");
        assert_eq!(retry.routing_keys(), ["invoices.delayed".to_owned()]);
        assert!(!retry.is_durable());
        assert_eq!(retry.arguments()[AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY], str_arg("invoice.*"));

        let main = expanded.get_queue("invoices").unwrap();
        assert_eq!(main.arguments()[AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY], str_arg("invoices.delayed"));
    }

    #[test]
    fn should_share_retry_exchange_between_queues_of_one_exchange() {
        let base = orders_topology().queue(
            QueueDefinition::new("orders-audit", "orders")
                .routing_key("order.#")
                .with_retry(RetryPolicy::new(1, 1000)),
        );

        let expanded = expand(&base).unwrap();

        assert_eq!(expanded.exchanges().count(), 2);
        assert!(expanded.get_queue("orders.retry").is_some());
        assert!(expanded.get_queue("orders-audit.retry").is_some());
    }

    #[test]
    fn should_fail_on_retry_queue_collision() {
        let base = orders_topology().queue(QueueDefinition::new("orders.retry", "orders"));

        assert_eq!(
            expand(&base),
            Err(AmqpError::QueueNameCollision("orders.retry".to_owned()))
        );
    }

    #[test]
    fn should_fail_on_conflicting_retry_exchange() {
        let base = orders_topology().exchange(ExchangeDefinition::new("orders.retry").fanout());

        assert_eq!(
            expand(&base),
            Err(AmqpError::ExchangeConflict("orders.retry".to_owned()))
        );
    }

    #[test]
    fn should_not_reuse_auto_delete_exchange_as_retry_exchange() {
        let base = orders_topology()
            .exchange(ExchangeDefinition::new("orders.retry").auto_delete());

        assert_eq!(
            expand(&base),
            Err(AmqpError::ExchangeConflict("orders.retry".to_owned()))
        );
    }

    #[test]
    fn should_reuse_identical_configured_retry_exchange() {
        let base = orders_topology().exchange(ExchangeDefinition::new("orders.retry"));

        let expanded = expand(&base).unwrap();

        let retry = expanded.get_exchange("orders.retry").unwrap();
        assert!(retry.is_durable());
        assert!(!retry.is_auto_delete());
    }

    #[test]
    fn should_fail_on_unknown_bound_exchange() {
        let base = Topology::new().queue(QueueDefinition::new("lost", "nowhere"));

        assert_eq!(
            expand(&base),
            Err(AmqpError::UnknownExchange {
                queue: "lost".to_owned(),
                exchange: "nowhere".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn should_install_exchanges_then_queues_then_bindings() {
        let topology = expand(&orders_topology()).unwrap();
        let mut seq = Sequence::new();
        let mut broker = MockBroker::new();

        broker
            .expect_declare_exchange()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        broker
            .expect_declare_queue()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        broker
            .expect_bind()
            .withf(|q, e, k| q == "orders" && e == "orders" && k == "order.created")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        broker
            .expect_bind()
            .withf(|q, e, k| q == "orders.retry" && e == "orders.retry" && k == "orders.retry")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        topology.install(&broker).await.unwrap();
    }

    #[tokio::test]
    async fn should_stop_install_on_declare_failure() {
        let topology = orders_topology();
        let mut broker = MockBroker::new();

        broker
            .expect_declare_exchange()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));

        assert_eq!(
            topology.install(&broker).await,
            Err(AmqpError::DeclareExchangeError("orders".to_owned()))
        );
    }
}
