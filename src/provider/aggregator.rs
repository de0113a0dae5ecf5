//! Provider aggregation.
//!
//! Runs every configured provider concurrently and multiplexes their
//! messages onto one channel. Providers with a non-zero throttle get a ring
//! channel in front of the shared channel: a coalescing buffer of capacity
//! one that always keeps the most-recent undelivered message and releases
//! messages no faster than one per throttle interval. Freshness beats
//! completeness.

use super::{quiet_init, Provider, ShutdownSignal, FILE_PROVIDER_NAME, INTERNAL_PROVIDER_NAME};
use crate::config::dynamic::Message;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// A coalescing channel of capacity one: sending replaces any undelivered
/// value, receiving yields the most recent one.
pub fn ring_channel<T: Clone>() -> (RingSender<T>, RingReceiver<T>) {
    let (tx, rx) = watch::channel(None);
    (RingSender { tx }, RingReceiver { rx })
}

pub struct RingSender<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> RingSender<T> {
    /// Replace the pending value; never blocks.
    pub fn send(&self, value: T) {
        let _ = self.tx.send(Some(value));
    }
}

pub struct RingReceiver<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> RingReceiver<T> {
    /// Wait for the next undelivered value. Returns `None` once all senders
    /// are gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            let value = self.rx.borrow_and_update().clone();
            if value.is_some() {
                return value;
            }
        }
    }
}

/// Aggregates all configured providers behind a single output channel.
///
/// The file-like provider is started first; the internal provider is started
/// last so the watcher can use its announcement as the bootstrap-complete
/// signal.
pub struct ProviderAggregator {
    file_provider: Option<Arc<dyn Provider>>,
    internal_provider: Option<Arc<dyn Provider>>,
    providers: Vec<Arc<dyn Provider>>,
    throttle: Duration,
}

impl ProviderAggregator {
    pub fn new(throttle: Duration) -> Self {
        Self {
            file_provider: None,
            internal_provider: None,
            providers: Vec::new(),
            throttle,
        }
    }

    /// Initialize and register a provider; a failing `init` logs and skips.
    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) {
        if !quiet_init(provider.as_ref()) {
            return;
        }

        match provider.name() {
            FILE_PROVIDER_NAME => self.file_provider = Some(provider),
            INTERNAL_PROVIDER_NAME => self.internal_provider = Some(provider),
            _ => self.providers.push(provider),
        }
    }

    /// Launch every provider. Returns once all providers have been started;
    /// the providers themselves keep running on spawned tasks until the
    /// shutdown signal fires.
    pub async fn provide(&self, tx: mpsc::Sender<Message>, shutdown: &ShutdownSignal) -> Result<()> {
        if let Some(file) = &self.file_provider {
            launch_provider(file.clone(), tx.clone(), shutdown.resubscribe(), self.throttle);
        }

        for provider in &self.providers {
            launch_provider(
                provider.clone(),
                tx.clone(),
                shutdown.resubscribe(),
                self.throttle,
            );
        }

        // The internal provider must be the last because the watcher uses it
        // to know that all the providers are loaded.
        if let Some(internal) = &self.internal_provider {
            launch_provider(
                internal.clone(),
                tx.clone(),
                shutdown.resubscribe(),
                self.throttle,
            );
        }

        Ok(())
    }
}

fn launch_provider(
    provider: Arc<dyn Provider>,
    tx: mpsc::Sender<Message>,
    shutdown: ShutdownSignal,
    default_throttle: Duration,
) {
    let throttle = provider.throttle_duration().unwrap_or(default_throttle);
    info!(provider = provider.name(), "Starting provider");

    tokio::spawn(async move {
        let result = if throttle.is_zero() {
            provider.provide(tx, shutdown).await
        } else {
            throttled_provide(provider.as_ref(), tx, shutdown, throttle).await
        };

        if let Err(e) = result {
            error!(provider = provider.name(), "Cannot start the provider: {}", e);
        }
    });
}

/// Runs the provider behind a ring channel plus a pacing relay, so the
/// consumer sees at most one message per throttle interval and always the
/// most recent one.
async fn throttled_provide(
    provider: &dyn Provider,
    tx: mpsc::Sender<Message>,
    shutdown: ShutdownSignal,
    throttle: Duration,
) -> Result<()> {
    let (ring_tx, mut ring_rx) = ring_channel::<Message>();
    let (local_tx, mut local_rx) = mpsc::channel::<Message>(1);

    // Coalesce: whatever the provider produces lands in the ring slot
    // immediately, overwriting any undelivered message.
    let mut fill_shutdown = shutdown.resubscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = fill_shutdown.recv() => return,
                msg = local_rx.recv() => match msg {
                    Some(msg) => ring_tx.send(msg),
                    None => return,
                },
            }
        }
    });

    // Pace: deliver the freshest message, then hold for the interval.
    let mut pace_shutdown = shutdown.resubscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = pace_shutdown.recv() => return,
                msg = ring_rx.recv() => {
                    let Some(msg) = msg else { return };
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(throttle).await;
                }
            }
        }
    });

    provider.provide(local_tx, shutdown).await
}
