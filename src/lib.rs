// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod shutdown;
pub mod topology;

pub use consumer::{count_prior_failures, decode_payload, Outcome};
