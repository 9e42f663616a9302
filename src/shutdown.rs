// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Shutdown
//!
//! The process keeps a [`ShutdownHandle`] and every consumption loop gets a
//! [`ShutdownSignal`] clone. Loops select on [`ShutdownSignal::wait`] next to
//! their delivery stream, so a trigger stops them from pulling new deliveries
//! without interrupting the one being handled.

use tokio::sync::watch;
use tracing::info;

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Observed by the consumption loops. Dropping the handle counts as a
/// trigger.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn new_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    /// Asks every consumption loop to stop after its current delivery.
    pub fn trigger(self) {
        info!(loops = self.tx.receiver_count(), "stopping consumers");
        // no receiver left means no loop to stop
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Resolves once shutdown was triggered, immediately if it already was.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|&stop| stop).await;
    }
}

/// Waits for `SIGINT` or `SIGTERM` and returns the name of the one received.
#[cfg(unix)]
pub async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
