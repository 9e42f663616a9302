// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module implements the per-message decision of a consumption loop:
//! decode the payload, count the failures the message already went through on
//! the current queue, run the queue's handler and settle the delivery.
//!
//! - handler success: ack
//! - handler failure with attempts left: nack without requeue, which makes the
//!   broker dead-letter the message into the queue's retry loop
//! - handler failure with no attempts left: ack, dropping the message

use crate::{
    broker::{DeathRecord, InboundMessage},
    errors::{AmqpError, HandlerError},
    handler::MessageHandler,
    otel,
    queue::QueueDefinition,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::{Map, Value};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, info, warn};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled successfully and acknowledged.
    Acked,
    /// Rejected without requeue so the broker routes it to the retry loop.
    Retried,
    /// Failed with its attempts exhausted, acknowledged to drop it.
    Dropped,
}

/// Number of times `queue` has already dead-lettered the message.
///
/// Uses the first death record naming `queue`; zero when there is none.
pub fn count_prior_failures(deaths: &[DeathRecord], queue: &str) -> u64 {
    deaths
        .iter()
        .find(|death| death.queue == queue)
        .map(|death| death.count)
        .unwrap_or(0)
}

/// Decodes a JSON body. Anything that is not a JSON document, as well as a
/// `null` document, becomes an empty object.
pub fn decode_payload(data: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(data) {
        Ok(Value::Null) => Value::Object(Map::new()),
        Ok(value) => value,
        Err(err) => {
            warn!(error = err.to_string(), "undecodable payload, using an empty one");
            Value::Object(Map::new())
        }
    }
}

/// Processes one delivery taken from `queue`.
///
/// A missing handler counts as a handler failure. Errors returned here come
/// from settling the delivery with the broker only.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    msg: InboundMessage,
    queue: &QueueDefinition,
    handler: Option<&Arc<dyn MessageHandler>>,
) -> Result<Outcome, AmqpError> {
    let (_ctx, mut span) = otel::new_span(&msg.headers, tracer, &queue.name);

    let retries = count_prior_failures(&msg.deaths, &queue.name);
    let payload = decode_payload(&msg.data);

    debug!(
        queue = queue.name,
        routing_key = msg.routing_key,
        retries,
        "received message"
    );

    let result = match handler {
        Some(handler) => handler.handle(&msg.routing_key, &payload).await,
        None => Err(HandlerError::new(format!("handler missing for [{}]", queue.name))),
    };

    let err = match result {
        Ok(()) => {
            info!(
                queue = queue.name,
                routing_key = msg.routing_key,
                attempt = retries + 1,
                "message processed"
            );
            return match msg.acker.ack().await {
                Err(e) => {
                    error!(error = e.to_string(), "error whiling ack msg");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(e)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(Outcome::Acked)
                }
            };
        }
        Err(err) => err,
    };

    error!(
        queue = queue.name,
        error = err.to_string(),
        payload = %payload,
        retry = retries,
        "handler failure"
    );
    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    if retries >= u64::from(queue.max_attempts()) {
        error!(
            queue = queue.name,
            routing_key = msg.routing_key,
            retries,
            "dropping message after too many attempts"
        );
        return match msg.acker.ack().await {
            Err(e) => {
                error!(error = e.to_string(), "error whiling ack msg to drop it");
                span.record_error(&e);
                Err(e)
            }
            _ => Ok(Outcome::Dropped),
        };
    }

    warn!(
        queue = queue.name,
        attempt = retries + 1,
        error = err.to_string(),
        "error whiling handling msg, retrying later"
    );
    match msg.acker.nack(false).await {
        Err(e) => {
            error!(error = e.to_string(), "error whiling nack msg");
            span.record_error(&e);
            Err(e)
        }
        _ => Ok(Outcome::Retried),
    }
}
