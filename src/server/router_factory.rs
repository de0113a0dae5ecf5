//! Compiling snapshots into per-entry-point handler tables.
//!
//! The factory never fails as a whole: a router with an unparsable rule or
//! an unresolvable reference is compiled down to the 503 terminal (or
//! skipped, for TCP/UDP) and everything else stays live.

use super::watcher::Snapshot;
use crate::config::{EntryPointProtocol, StaticConfig};
use crate::http::api::ApiHandler;
use crate::http::router::{CompiledHttpRoute, HttpRouterTable};
use crate::http::{SharedHandler, StatusHandler};
use crate::middleware::MiddlewareBuilder;
use crate::proxy::ReverseProxy;
use crate::rule::{self, matcher};
use crate::service::ServiceManager;
use crate::tcp::router::{CompiledTcpRoute, TcpRouterTable};
use crate::tcp::TcpServiceHandler;
use crate::tls::TlsManager;
use crate::udp::router::{flatten_udp_service, CompiledUdpRoute, UdpRouterTable};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// The compiled handlers of one snapshot, per entry point.
pub struct EntryPointHandlers {
    pub http: HashMap<String, Arc<HttpRouterTable>>,
    pub tcp: HashMap<String, Arc<TcpRouterTable>>,
    pub udp: HashMap<String, Arc<UdpRouterTable>>,
}

pub struct RouterFactory {
    static_config: StaticConfig,
    proxy: Arc<ReverseProxy>,
}

impl RouterFactory {
    pub fn new(static_config: StaticConfig, proxy: Arc<ReverseProxy>) -> Self {
        Self {
            static_config,
            proxy,
        }
    }

    /// Produce fresh, immutable handler tables for every entry point.
    pub fn create_routers(&self, snapshot: &Arc<Snapshot>) -> EntryPointHandlers {
        let configuration = &snapshot.configuration;

        let mut internals: HashMap<String, SharedHandler> = HashMap::new();
        internals.insert(
            "api@internal".to_string(),
            Arc::new(ApiHandler::new(snapshot.clone())),
        );

        let mut services = ServiceManager::new(
            configuration.http.services.clone(),
            self.proxy.clone(),
            internals,
        );
        let middlewares = MiddlewareBuilder::new(configuration.http.middlewares.clone());
        let tls_manager = Arc::new(TlsManager::new(&configuration.tls));

        let mut handlers = EntryPointHandlers {
            http: HashMap::new(),
            tcp: HashMap::new(),
            udp: HashMap::new(),
        };

        for (ep_name, ep) in &self.static_config.entry_points {
            match ep.protocol {
                EntryPointProtocol::Tcp => {
                    let http_table = Arc::new(self.build_http_table(
                        ep_name,
                        configuration,
                        &mut services,
                        &middlewares,
                    ));
                    let tcp_table = self.build_tcp_table(
                        ep_name,
                        configuration,
                        tls_manager.clone(),
                        http_table.clone(),
                    );
                    info!(
                        entry_point = ep_name.as_str(),
                        http_routers = http_table.len(),
                        tcp_routers = tcp_table.route_count(),
                        "Compiled entry point handlers"
                    );
                    handlers.http.insert(ep_name.clone(), http_table);
                    handlers.tcp.insert(ep_name.clone(), tcp_table);
                }
                EntryPointProtocol::Udp => {
                    let udp_table = self.build_udp_table(ep_name, configuration);
                    handlers.udp.insert(ep_name.clone(), udp_table);
                }
            }
        }

        handlers
    }

    fn build_http_table(
        &self,
        ep_name: &str,
        configuration: &crate::config::dynamic::Configuration,
        services: &mut ServiceManager,
        middlewares: &MiddlewareBuilder,
    ) -> HttpRouterTable {
        let mut routes = Vec::new();

        for (name, router) in &configuration.http.routers {
            if !router.entry_points.iter().any(|ep| ep == ep_name) {
                continue;
            }

            let expr = match rule::parse(&router.rule) {
                Ok(expr) => expr,
                Err(e) => {
                    error!(router = name.as_str(), "Invalid rule: {}", e);
                    continue;
                }
            };
            let matcher = match matcher::compile_http(&expr) {
                Ok(matcher) => matcher,
                Err(e) => {
                    error!(router = name.as_str(), "Invalid matcher: {}", e);
                    continue;
                }
            };

            // Unknown or cyclic references yield the 503 terminal for this
            // router only.
            let handler = services
                .build(&router.service)
                .and_then(|h| middlewares.wrap(h, &router.middlewares, services))
                .unwrap_or_else(|e| {
                    error!(router = name.as_str(), "Unresolvable router: {}", e);
                    StatusHandler::service_unavailable()
                });

            routes.push(CompiledHttpRoute {
                name: name.clone(),
                priority: router.priority.unwrap_or_else(|| expr.priority()),
                matcher,
                handler,
            });
        }

        HttpRouterTable::new(routes)
    }

    fn build_tcp_table(
        &self,
        ep_name: &str,
        configuration: &crate::config::dynamic::Configuration,
        tls_manager: Arc<TlsManager>,
        http_table: Arc<HttpRouterTable>,
    ) -> Arc<TcpRouterTable> {
        let mut routes = Vec::new();

        for (name, router) in &configuration.tcp.routers {
            if !router.entry_points.iter().any(|ep| ep == ep_name) {
                continue;
            }

            let expr = match rule::parse(&router.rule) {
                Ok(expr) => expr,
                Err(e) => {
                    error!(router = name.as_str(), "Invalid TCP rule: {}", e);
                    continue;
                }
            };
            let matcher = match matcher::compile_tcp(&expr) {
                Ok(matcher) => matcher,
                Err(e) => {
                    error!(router = name.as_str(), "Invalid TCP matcher: {}", e);
                    continue;
                }
            };

            let service = match TcpServiceHandler::build(&router.service, &configuration.tcp.services)
            {
                Ok(service) => Some(service),
                Err(e) => {
                    error!(router = name.as_str(), "Unresolvable TCP service: {}", e);
                    None
                }
            };

            routes.push(CompiledTcpRoute {
                name: name.clone(),
                priority: router.priority.unwrap_or_else(|| expr.priority()),
                matcher,
                tls: router.tls.clone(),
                service,
            });
        }

        TcpRouterTable::new(routes, tls_manager, http_table)
    }

    fn build_udp_table(
        &self,
        ep_name: &str,
        configuration: &crate::config::dynamic::Configuration,
    ) -> Arc<UdpRouterTable> {
        let mut routes = Vec::new();

        for (name, router) in &configuration.udp.routers {
            if !router.entry_points.iter().any(|ep| ep == ep_name) {
                continue;
            }

            match flatten_udp_service(&router.service, &configuration.udp.services) {
                Ok(addresses) => routes.push(CompiledUdpRoute {
                    name: name.clone(),
                    addresses,
                }),
                Err(e) => {
                    error!(router = name.as_str(), "Unresolvable UDP service: {}", e);
                }
            }
        }

        UdpRouterTable::new(routes)
    }
}
