//! Configuration providers.
//!
//! A provider is one configuration origin: it pushes [`Message`]s carrying
//! partial configurations tagged with its source name until cancelled. The
//! aggregator runs every provider concurrently and multiplexes their output
//! onto one channel.

pub mod aggregator;
pub mod file;
pub mod internal;
pub mod sanitize;

use crate::config::dynamic::Message;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

/// Source name of the internal provider carrying built-ins. The watcher
/// refuses to publish before this source has announced itself.
pub const INTERNAL_PROVIDER_NAME: &str = "internal";

/// Source name of the file-like provider, started before all others.
pub const FILE_PROVIDER_NAME: &str = "file";

/// Reserved source name for ACME TLS-ALPN certificates.
pub const ACME_TLS1_SOURCE: &str = "tlsalpn.acme";

/// Shutdown signal handed to every long-running provider task.
pub type ShutdownSignal = broadcast::Receiver<()>;

/// The contract every configuration origin implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique source name; qualifies every object this provider emits.
    fn name(&self) -> &str;

    /// One-time initialization; a failure here skips the provider.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Push messages on `tx` until the shutdown signal fires.
    async fn provide(&self, tx: mpsc::Sender<Message>, shutdown: ShutdownSignal) -> Result<()>;

    /// Per-provider throttle override; `None` means the global default.
    fn throttle_duration(&self) -> Option<Duration> {
        None
    }
}

/// Qualify `name` with the given source unless it already carries one.
pub fn make_qualified_name(source: &str, name: &str) -> String {
    if name.is_empty() || name.contains('@') {
        return name.to_string();
    }
    format!("{}@{}", name, source)
}

/// Split a possibly-qualified name into (local, source).
pub fn split_qualified(name: &str) -> (&str, Option<&str>) {
    match name.split_once('@') {
        Some((local, source)) => (local, Some(source)),
        None => (name, None),
    }
}

/// Unique name for one of several same-kind sources: `type-N` when the user
/// kept the default name, `type-name` otherwise.
pub fn multi_provider_name(name: &str, kind: &str, index: usize) -> String {
    if name == kind {
        format!("{}-{}", kind, index)
    } else {
        format!("{}-{}", kind, name)
    }
}

/// Wrapper that intercepts every message of the inner provider and strips
/// disallowed cross-source references before forwarding.
pub struct MultiProvider {
    inner: Arc<dyn Provider>,
}

impl MultiProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Provider for MultiProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn init(&self) -> Result<()> {
        self.inner.init()
    }

    fn throttle_duration(&self) -> Option<Duration> {
        self.inner.throttle_duration()
    }

    async fn provide(&self, tx: mpsc::Sender<Message>, shutdown: ShutdownSignal) -> Result<()> {
        let (local_tx, mut local_rx) = mpsc::channel::<Message>(1);

        let mut relay_shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = relay_shutdown.recv() => return,
                    msg = local_rx.recv() => {
                        let Some(mut msg) = msg else { return };
                        msg.configuration =
                            sanitize::sanitize_references(&msg.source_name, &msg.configuration);
                        if tx.send(msg).await.is_err() {
                            debug!("Aggregated channel closed, stopping sanitising relay");
                            return;
                        }
                    }
                }
            }
        });

        self.inner.provide(local_tx, shutdown).await
    }
}

/// Call `init` and log-and-skip on failure, so a broken provider never
/// prevents the others from running.
pub(crate) fn quiet_init(provider: &dyn Provider) -> bool {
    if let Err(e) = provider.init() {
        error!(provider = provider.name(), "Error while initializing provider: {}", e);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{Configuration, Router};

    struct OneShot {
        configuration: Configuration,
    }

    #[async_trait]
    impl Provider for OneShot {
        fn name(&self) -> &str {
            "docker"
        }

        async fn provide(&self, tx: mpsc::Sender<Message>, _shutdown: ShutdownSignal) -> Result<()> {
            let _ = tx
                .send(Message {
                    source_name: "docker".to_string(),
                    configuration: self.configuration.clone(),
                })
                .await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_multi_provider_sanitizes_messages() {
        let mut configuration = Configuration::default();
        configuration.http.routers.insert(
            "fabricated".to_string(),
            Router {
                rule: "Host(`a`)".to_string(),
                service: "svc@docker-2".to_string(),
                ..Default::default()
            },
        );
        configuration.http.routers.insert(
            "fine".to_string(),
            Router {
                rule: "Host(`b`)".to_string(),
                service: "svc@file".to_string(),
                ..Default::default()
            },
        );

        let wrapped = MultiProvider::new(Arc::new(OneShot { configuration }));
        let (tx, mut rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        wrapped.provide(tx, shutdown_rx).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert!(msg.configuration.http.routers.contains_key("fine"));
        assert!(!msg.configuration.http.routers.contains_key("fabricated"));
    }

    #[test]
    fn test_make_qualified_name() {
        assert_eq!(make_qualified_name("file", "router"), "router@file");
        assert_eq!(make_qualified_name("file", "router@docker"), "router@docker");
        assert_eq!(make_qualified_name("file", ""), "");
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("svc@file"), ("svc", Some("file")));
        assert_eq!(split_qualified("svc"), ("svc", None));
    }

    #[test]
    fn test_multi_provider_name() {
        assert_eq!(multi_provider_name("consul", "consul", 2), "consul-2");
        assert_eq!(multi_provider_name("east", "consul", 2), "consul-east");
    }
}
