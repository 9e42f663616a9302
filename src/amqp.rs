// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker Gateway
//!
//! Implementation of [`Broker`] on top of a lapin [`Channel`], together with the
//! decoding of delivery metadata (`x-death` history, string headers) into the
//! transport independent [`InboundMessage`].

use crate::{
    broker::{Acknowledger, Broker, DeathRecord, DeliveryStream, InboundMessage},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueArgument, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, ShortString},
    BasicProperties, Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the queue field in an x-death record
pub const AMQP_HEADERS_QUEUE: &str = "queue";
/// Constant for the count field in an x-death record
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode marking a message as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// Maximum length in bytes of an AMQP short string, e.g. a consumer tag
const SHORT_STRING_MAX_LEN: usize = 255;

/// [`Broker`] backed by a single lapin channel.
///
/// Declarations, QoS and consumers share the channel given at construction.
/// Publishing goes through whichever instance the publisher was built with,
/// which lets the process keep publishing on its own channel.
pub struct AmqpBroker {
    channel: Arc<Channel>,
}

impl AmqpBroker {
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpBroker> {
        Arc::new(AmqpBroker { channel })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                field_table(&def.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let tag = consumer_tag(queue);

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        debug!(queue, tag, "consumer registered");

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(inbound_message(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
        persistent: bool,
    ) -> Result<(), AmqpError> {
        let headers: BTreeMap<ShortString, AMQPValue> = headers
            .iter()
            .map(|(k, v)| {
                (
                    ShortString::from(k.clone()),
                    AMQPValue::LongString(LongString::from(v.clone())),
                )
            })
            .collect();

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));
        if persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map(|_| ())
        .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

/// `{queue}.{uuid}`, with the queue name cut so the tag fits a short string.
fn consumer_tag(queue: &str) -> String {
    let id = Uuid::new_v4().to_string();
    let mut end = queue.len().min(SHORT_STRING_MAX_LEN - id.len() - 1);
    while !queue.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}.{}", &queue[..end], id)
}

fn inbound_message(delivery: Delivery) -> InboundMessage {
    InboundMessage {
        routing_key: delivery.routing_key.as_str().to_owned(),
        headers: string_headers(&delivery.properties),
        deaths: death_records(&delivery.properties),
        data: delivery.data,
        acker: Box::new(delivery.acker),
    }
}

/// Converts queue arguments to the AMQP field table sent on declaration.
///
/// Integers fitting 32 bits are sent as long-int, the rest as long-long-int.
pub(crate) fn field_table(args: &BTreeMap<String, QueueArgument>) -> FieldTable {
    let mut table = BTreeMap::new();

    for (key, value) in args {
        let value = match value {
            QueueArgument::Int(v) => match i32::try_from(*v) {
                Ok(small) => AMQPValue::LongInt(LongInt::from(small)),
                Err(_) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            },
            QueueArgument::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }

    FieldTable::from(table)
}

/// Decodes the broker's `x-death` header into death records.
///
/// Records lacking a queue name are skipped; a missing or non integer count
/// reads as zero.
pub(crate) fn death_records(props: &AMQPProperties) -> Vec<DeathRecord> {
    let Some(headers) = props.headers() else {
        return vec![];
    };

    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get(AMQP_HEADERS_X_DEATH) else {
        return vec![];
    };

    deaths
        .as_slice()
        .iter()
        .filter_map(|value| match value {
            AMQPValue::FieldTable(table) => {
                let fields = table.inner();
                let queue = fields.get(AMQP_HEADERS_QUEUE).and_then(as_text)?;
                let count = fields.get(AMQP_HEADERS_COUNT).map(as_count).unwrap_or(0);
                Some(DeathRecord { queue, count })
            }
            _ => None,
        })
        .collect()
}

/// Collects the string-valued headers of a delivery.
pub(crate) fn string_headers(props: &AMQPProperties) -> BTreeMap<String, String> {
    let Some(headers) = props.headers() else {
        return BTreeMap::new();
    };

    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| as_text(value).map(|text| (key.as_str().to_owned(), text)))
        .collect()
}

fn as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
            .map_err(|e| error!("error decoding header value {:?}", e))
            .ok()
            .map(str::to_owned),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

fn as_count(value: &AMQPValue) -> u64 {
    let count = match value {
        AMQPValue::LongLongInt(n) => *n,
        AMQPValue::LongInt(n) => i64::from(*n),
        AMQPValue::ShortInt(n) => i64::from(*n),
        AMQPValue::ShortShortInt(n) => i64::from(*n),
        AMQPValue::LongUInt(n) => i64::from(*n),
        AMQPValue::ShortUInt(n) => i64::from(*n),
        AMQPValue::ShortShortUInt(n) => i64::from(*n),
        _ => 0,
    };

    u64::try_from(count).unwrap_or(0)
}
