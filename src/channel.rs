// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of the AMQP connection and of the channels
//! opened on it. The process keeps one connection, one channel for declarations
//! and consumers, and one channel for publishing.

use crate::{config::Config, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code sent when closing the connection normally.
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// Creates a new AMQP connection to RabbitMQ.
///
/// # Parameters
/// * `cfg` - Configuration containing RabbitMQ connection details like host, port, credentials, etc.
///
/// # Returns
/// The connection, wrapped in Arc for sharing, or an error on failure.
pub async fn new_amqp_connection(cfg: &Config) -> Result<Arc<Connection>, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    match Connection::connect(&cfg.rabbitmq.uri(), options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(Arc::new(conn))
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }
}

/// Opens a new channel on `conn`.
pub async fn new_amqp_channel(conn: &Connection) -> Result<Arc<Channel>, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(Arc::new(c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

/// Closes `conn`. Unsettled deliveries are requeued by the broker.
pub async fn close_amqp_connection(conn: &Connection) -> Result<(), AmqpError> {
    conn.close(AMQP_REPLY_SUCCESS, "shutdown").await.map_err(|err| {
        error!(error = err.to_string(), "error to close the connection");
        AmqpError::ConnectionError(err.to_string())
    })
}
