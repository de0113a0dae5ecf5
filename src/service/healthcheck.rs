//! Active HTTP health checking for load-balanced servers.
//!
//! One task per configured load balancer probes every server on the
//! configured interval and flips its availability flag. Tasks hold only
//! weak references, so they die with the handler they were probing for.

use super::loadbalancer::{LoadBalancerHandler, ServerEntry};
use crate::config::dynamic::ServerHealthCheck;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

pub fn spawn_health_checker(handler: &Arc<LoadBalancerHandler>, config: &ServerHealthCheck) {
    let servers: Vec<Weak<ServerEntry>> =
        handler.servers().iter().map(Arc::downgrade).collect();
    let path = config.path.clone();
    let period = Duration::from_secs(config.interval_secs.max(1));
    let probe_timeout = Duration::from_secs(config.timeout_secs.max(1));

    tokio::spawn(async move {
        let client = hyper::Client::new();
        let mut ticker = interval(period);

        loop {
            ticker.tick().await;

            let mut alive = false;
            for weak in &servers {
                let Some(server) = weak.upgrade() else { continue };
                alive = true;

                let healthy = probe(&client, &server.url, &path, probe_timeout).await;
                if healthy != server.is_up() {
                    if healthy {
                        info!(server = server.url.as_str(), "Server is back up");
                    } else {
                        warn!(server = server.url.as_str(), "Server failed health check");
                    }
                }
                server.set_up(healthy);
            }

            if !alive {
                debug!("All probed servers dropped, stopping health checker");
                return;
            }
        }
    });
}

async fn probe(
    client: &hyper::Client<hyper::client::HttpConnector>,
    base_url: &str,
    path: &str,
    probe_timeout: Duration,
) -> bool {
    let url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let Ok(uri) = url.parse::<hyper::Uri>() else {
        return false;
    };

    match timeout(probe_timeout, client.get(uri)).await {
        Ok(Ok(resp)) => resp.status().is_success(),
        Ok(Err(_)) | Err(_) => false,
    }
}
