//! Configuration watcher.
//!
//! Holds the last message per source, debounces bursts, and on a quiet
//! window runs sanitisation, merge and model expansion, then publishes an
//! immutable snapshot. Nothing is published before the internal provider
//! has announced itself.

use super::merge::{apply_model, merge_configuration};
use crate::config::dynamic::{Configuration, Configurations, Message};
use crate::provider::{sanitize::sanitize_references, ShutdownSignal, INTERNAL_PROVIDER_NAME};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// An immutable compiled routing table input.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub configuration: Configuration,
    pub generation: u64,
    pub created_at: SystemTime,
}

/// Receiving side of snapshot publication. Generations are monotonic;
/// subscribers never observe them out of order.
pub type SnapshotReceiver = watch::Receiver<Option<Arc<Snapshot>>>;

pub struct ConfigurationWatcher {
    rx: mpsc::Receiver<Message>,
    configurations: Configurations,
    default_entry_points: Vec<String>,
    debounce: Duration,
    required_provider: String,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
    generation: u64,
}

impl ConfigurationWatcher {
    pub fn new(
        rx: mpsc::Receiver<Message>,
        default_entry_points: Vec<String>,
        debounce: Duration,
    ) -> (Self, SnapshotReceiver) {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        (
            Self {
                rx,
                configurations: Configurations::new(),
                default_entry_points,
                debounce,
                required_provider: INTERNAL_PROVIDER_NAME.to_string(),
                snapshot_tx,
                generation: 0,
            },
            snapshot_rx,
        )
    }

    /// Single-threaded loop over the watcher state; only the ring channels
    /// and subscriber delivery are concurrent with it.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let mut deadline: Option<Instant> = None;

        loop {
            let current_deadline = deadline;
            let sleep = async move {
                match current_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    // Best-effort final publication of what we have.
                    if deadline.is_some() && self.bootstrapped() {
                        self.publish();
                    }
                    info!("Configuration watcher stopped");
                    return;
                }
                _ = sleep => {
                    deadline = None;
                    if self.bootstrapped() {
                        self.publish();
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.store(msg) {
                                deadline = Some(Instant::now() + self.debounce);
                            }
                        }
                        None => {
                            // Providers are gone; flush pending state.
                            if deadline.is_some() && self.bootstrapped() {
                                self.publish();
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    fn bootstrapped(&self) -> bool {
        self.configurations.contains_key(&self.required_provider)
    }

    /// Replace the entry for the message's source. Returns false when the
    /// message carries no change for that source.
    fn store(&mut self, msg: Message) -> bool {
        if let Some(existing) = self.configurations.get(&msg.source_name) {
            if *existing == msg.configuration {
                debug!(source = msg.source_name.as_str(), "Skipping unchanged configuration");
                return false;
            }
        }

        debug!(source = msg.source_name.as_str(), "Configuration received");
        self.configurations
            .insert(msg.source_name, msg.configuration);
        true
    }

    fn publish(&mut self) {
        let mut sanitized = Configurations::new();
        for (source, configuration) in &self.configurations {
            sanitized.insert(source.clone(), sanitize_references(source, configuration));
        }

        let merged = merge_configuration(&sanitized, &self.default_entry_points);
        let configuration = apply_model(merged);

        self.generation += 1;
        let snapshot = Arc::new(Snapshot {
            configuration,
            generation: self.generation,
            created_at: SystemTime::now(),
        });

        crate::metrics::record_reload();
        crate::metrics::record_router_counts(
            snapshot.configuration.http.routers.len(),
            snapshot.configuration.tcp.routers.len(),
            snapshot.configuration.udp.routers.len(),
        );

        info!(
            generation = snapshot.generation,
            http_routers = snapshot.configuration.http.routers.len(),
            "Publishing configuration snapshot"
        );
        let _ = self.snapshot_tx.send(Some(snapshot));
    }
}
