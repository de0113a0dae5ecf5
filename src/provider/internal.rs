//! Internal provider.
//!
//! Emits the built-in configuration: the `api` service, the default servers
//! transport and the per-entry-point models derived from the static tree.
//! The aggregator starts it last; the watcher uses its announcement as the
//! bootstrap-complete signal and publishes nothing before it.

use super::{Provider, ShutdownSignal, INTERNAL_PROVIDER_NAME};
use crate::config::dynamic::{
    Configuration, Message, Model, ServersLoadBalancer, ServersTransport, Service,
};
use crate::config::StaticConfig;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Name of the built-in API service (qualified: `api@internal`).
pub const API_SERVICE_NAME: &str = "api";

pub struct InternalProvider {
    configuration: Configuration,
}

impl InternalProvider {
    pub fn new(static_config: &StaticConfig) -> Self {
        let mut configuration = Configuration::default();

        if static_config.api {
            // Declared as an empty load balancer; the service manager
            // swaps in the built-in handler for api@internal.
            configuration.http.services.insert(
                API_SERVICE_NAME.to_string(),
                Service::LoadBalancer(ServersLoadBalancer::default()),
            );
        }

        configuration
            .http
            .servers_transports
            .insert("default".to_string(), ServersTransport::default());

        // One empty model per entry point keeps model expansion total: every
        // router copy lands on exactly one entry point.
        for name in static_config.entry_points.keys() {
            configuration
                .http
                .models
                .insert(name.clone(), Model::default());
        }

        Self { configuration }
    }
}

#[async_trait]
impl Provider for InternalProvider {
    fn name(&self) -> &str {
        INTERNAL_PROVIDER_NAME
    }

    async fn provide(&self, tx: mpsc::Sender<Message>, _shutdown: ShutdownSignal) -> Result<()> {
        // A single announcement; built-ins never change at runtime.
        let _ = tx
            .send(Message {
                source_name: INTERNAL_PROVIDER_NAME.to_string(),
                configuration: self.configuration.clone(),
            })
            .await;
        Ok(())
    }
}
