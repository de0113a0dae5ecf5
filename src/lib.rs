use crate::config::StaticConfig;
use crate::entrypoint::EntryPoint;
use crate::error::Result;
use crate::gateway::client::GatewayClient;
use crate::provider::aggregator::ProviderAggregator;
use crate::provider::ShutdownSignal;
use crate::proxy::ReverseProxy;
use crate::server::router_factory::RouterFactory;
use crate::server::watcher::ConfigurationWatcher;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

pub mod config;
pub mod entrypoint;
pub mod error;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod provider;
pub mod proxy;
pub mod rule;
pub mod server;
pub mod service;
pub mod tcp;
pub mod tls;
pub mod udp;

/// The main router: wires providers, the configuration pipeline and the
/// entry points together.
pub struct Router {
    config: StaticConfig,
    gateway_client: Option<Arc<dyn GatewayClient>>,
}

impl Router {
    /// Create a new router with the provided static configuration.
    pub fn new(config: StaticConfig) -> Self {
        Router {
            config,
            gateway_client: None,
        }
    }

    /// Create a new router by loading the static configuration from a file.
    pub fn from_file(config_path: &str) -> Result<Self> {
        let config = config::load_config(config_path)?;
        Ok(Router::new(config))
    }

    /// Attach the cluster-state client backing the Gateway-API provider.
    pub fn with_gateway_client(mut self, client: Arc<dyn GatewayClient>) -> Self {
        self.gateway_client = Some(client);
        self
    }

    /// Run until the shutdown signal fires.
    pub async fn start(&self, shutdown: ShutdownSignal) -> Result<()> {
        let (message_tx, message_rx) = mpsc::channel(64);

        // Providers.
        let mut aggregator = ProviderAggregator::new(self.config.throttle_duration());
        if let Some(file_config) = &self.config.providers.file {
            aggregator.add_provider(Arc::new(provider::file::FileProvider::new(file_config)));
        }
        if let Some(gateway_config) = &self.config.providers.gateway {
            match &self.gateway_client {
                Some(client) => {
                    aggregator.add_provider(Arc::new(gateway::GatewayProvider::new(
                        client.clone(),
                        gateway_config,
                        &self.config,
                    )));
                }
                None => {
                    error!("Gateway provider enabled but no cluster client attached, skipping");
                }
            }
        }
        aggregator.add_provider(Arc::new(provider::internal::InternalProvider::new(
            &self.config,
        )));

        aggregator.provide(message_tx, &shutdown).await?;

        // Watcher.
        let (watcher, mut snapshots) = ConfigurationWatcher::new(
            message_rx,
            self.config.effective_default_entry_points(),
            self.config.throttle_duration(),
        );
        tokio::spawn(watcher.run(shutdown.resubscribe()));

        // Entry points.
        let mut entry_points = HashMap::new();
        for (name, ep_config) in &self.config.entry_points {
            let entry_point = EntryPoint::new(name.clone(), ep_config);
            tokio::spawn(entry_point.clone().run(shutdown.resubscribe()));
            entry_points.insert(name.clone(), entry_point);
        }

        // Snapshot switcher: compile and swap.
        let factory = RouterFactory::new(self.config.clone(), Arc::new(ReverseProxy::new()));
        let mut switcher_shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = switcher_shutdown.recv() => return,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let Some(snapshot) = snapshots.borrow_and_update().clone() else {
                            continue;
                        };

                        let handlers = factory.create_routers(&snapshot);
                        for (name, entry_point) in &entry_points {
                            if let Some(table) = handlers.tcp.get(name) {
                                entry_point.swap_tcp(table.clone());
                            }
                            if let Some(table) = handlers.udp.get(name) {
                                entry_point.swap_udp(table.clone());
                            }
                        }
                        info!(generation = snapshot.generation, "Installed new handlers");
                    }
                }
            }
        });

        // Block until shutdown.
        let mut shutdown = shutdown;
        let _ = shutdown.recv().await;
        info!("Router stopped");
        Ok(())
    }
}

// Re-export the pieces embedders touch most.
pub use config::dynamic::{Configuration, Message};
pub use config::{load_config, StaticConfig as ProxyConfig};
pub use server::watcher::Snapshot;
