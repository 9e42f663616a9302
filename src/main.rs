// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_retry::{
    amqp::AmqpBroker,
    channel::{close_amqp_connection, new_amqp_channel, new_amqp_connection},
    config::{Config, ConfigError, TopologyFile},
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    shutdown,
    topology::expand,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("broker error: {0}")]
    Amqp(#[from] AmqpError),

    #[error("signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    // Override with RUST_LOG, e.g. RUST_LOG=rabbitmq_retry=debug,lapin=warn
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rabbitmq_retry=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        if e.is_configuration() {
            error!("invalid configuration, nothing was consumed: {e}");
        } else {
            error!("fatal: {e}");
        }
        std::process::exit(1);
    }
}

impl AppError {
    /// Whether the failure comes from the configuration rather than from the
    /// broker or the process.
    fn is_configuration(&self) -> bool {
        match self {
            AppError::Config(_) => true,
            AppError::Amqp(err) => err.is_configuration(),
            AppError::Signal(_) => false,
        }
    }
}

/// Declares the topology, then consumes until SIGINT/SIGTERM or a broker error.
async fn run() -> Result<(), AppError> {
    let cfg = Config::load()?;
    cfg.log_summary();

    let file = TopologyFile::load(&cfg.topology_path)?;
    let handlers = file.handler_registry()?;
    let topology = Arc::new(expand(&file.topology())?);

    info!("connecting to RabbitMQ...");
    let conn = new_amqp_connection(&cfg).await?;
    let channel = new_amqp_channel(&conn).await?;

    let dispatcher = RabbitMQDispatcher::new(AmqpBroker::new(channel), topology, handlers);
    dispatcher.setup().await?;

    let (shutdown_handle, shutdown_signal) = shutdown::new_pair();
    let consuming = dispatcher.consume_blocking(shutdown_signal);
    tokio::pin!(consuming);

    info!("ready, press CTRL+C to quit");

    let result = tokio::select! {
        res = &mut consuming => res,
        sig = shutdown::wait_for_os_signal() => {
            info!(signal = sig?, "shutting down consumers...");
            shutdown_handle.trigger();
            consuming.await
        }
    };

    if let Err(err) = close_amqp_connection(&conn).await {
        error!(error = err.to_string(), "connection was not closed cleanly");
    }
    info!("connection closed");

    result.map_err(AppError::from)
}
