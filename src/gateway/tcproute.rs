//! TCPRoute and TLSRoute translation (experimental channel).
//!
//! TCPRoutes carry no match content, the listener decides; TLSRoutes match
//! on `HostSNI`, falling back to `HostSNI(*)` when the route names no
//! hostname. Listener TLS mode Passthrough keeps the stream sealed.

use super::client::{GatewayClient, RouteKind};
use super::resources::*;
use super::{
    allow_route, find_matching_hostnames, match_listener, normalize, status,
    update_route_condition_accepted, upsert_route_condition_resolved_refs, GatewayListener,
    GatewayProvider,
};
use crate::config::dynamic::{
    Configuration, RouterTlsConfig, TcpRouter, TcpServer, TcpServersLoadBalancer, TcpService,
    TcpWeightedRoundRobin, WrrService,
};
use std::collections::HashSet;
use std::sync::atomic::Ordering;

pub(crate) async fn load_tcp_routes(
    provider: &GatewayProvider,
    listeners: &[GatewayListener],
    conf: &mut Configuration,
) {
    let client = provider.client.as_ref();

    for route in client.list_tcp_routes() {
        let namespace = route.metadata.namespace.clone();
        let generation = route.metadata.generation;

        let mut parent_statuses = Vec::new();
        for parent_ref in &route.parent_refs {
            let mut conditions = vec![Condition::new(
                CONDITION_ACCEPTED,
                false,
                REASON_NO_MATCHING_PARENT,
                generation,
            )];

            for listener in listeners {
                if !match_listener(listener, &namespace, parent_ref) {
                    continue;
                }

                let mut accepted = true;
                if !allow_route(client, listener, &namespace, KIND_TCP_ROUTE) {
                    update_route_condition_accepted(
                        &mut conditions,
                        generation,
                        REASON_NOT_ALLOWED_BY_LISTENERS,
                    );
                    accepted = false;
                }

                if accepted {
                    listener.attached_routes.fetch_add(1, Ordering::Relaxed);
                    if listener.attached {
                        update_route_condition_accepted(&mut conditions, generation, REASON_ACCEPTED);
                    }
                }

                // A raw TCP listener carries no TLS config at all.
                let tls = listener.tls_mode.map(|mode| RouterTlsConfig {
                    options: String::new(),
                    passthrough: mode == TlsMode::Passthrough,
                });
                let (route_conf, resolve_condition) = load_tcp_route(
                    client,
                    listener,
                    &route.metadata,
                    &route.rules,
                    "HostSNI(`*`)".to_string(),
                    tls,
                );
                if accepted && listener.attached {
                    conf.tcp.routers.extend(route_conf.tcp.routers);
                    conf.tcp.services.extend(route_conf.tcp.services);
                }

                upsert_route_condition_resolved_refs(&mut conditions, resolve_condition);
            }

            parent_statuses.push(RouteParentStatus {
                parent_ref: parent_ref.clone(),
                controller_name: CONTROLLER_NAME.to_string(),
                conditions,
            });
        }

        status::write_route_status(
            client,
            RouteKind::Tcp,
            &namespace,
            &route.metadata.name,
            parent_statuses,
        )
        .await;
    }
}

pub(crate) async fn load_tls_routes(
    provider: &GatewayProvider,
    listeners: &[GatewayListener],
    conf: &mut Configuration,
) {
    let client = provider.client.as_ref();

    for route in client.list_tls_routes() {
        let namespace = route.metadata.namespace.clone();
        let generation = route.metadata.generation;

        let mut parent_statuses = Vec::new();
        for parent_ref in &route.parent_refs {
            let mut conditions = vec![Condition::new(
                CONDITION_ACCEPTED,
                false,
                REASON_NO_MATCHING_PARENT,
                generation,
            )];

            for listener in listeners {
                if !match_listener(listener, &namespace, parent_ref) {
                    continue;
                }

                let mut accepted = true;
                if !allow_route(client, listener, &namespace, KIND_TLS_ROUTE) {
                    update_route_condition_accepted(
                        &mut conditions,
                        generation,
                        REASON_NOT_ALLOWED_BY_LISTENERS,
                    );
                    accepted = false;
                }

                let (hostnames, hostnames_ok) =
                    find_matching_hostnames(listener.hostname.as_deref(), &route.hostnames);
                if !hostnames_ok {
                    update_route_condition_accepted(
                        &mut conditions,
                        generation,
                        REASON_NO_MATCHING_LISTENER_HOSTNAME,
                    );
                    accepted = false;
                }

                if accepted {
                    listener.attached_routes.fetch_add(1, Ordering::Relaxed);
                    if listener.attached {
                        update_route_condition_accepted(&mut conditions, generation, REASON_ACCEPTED);
                    }
                }

                let (route_conf, resolve_condition) = load_tcp_route(
                    client,
                    listener,
                    &route.metadata,
                    &route.rules,
                    build_sni_rule(&hostnames),
                    Some(RouterTlsConfig {
                        options: String::new(),
                        passthrough: listener.tls_mode != Some(TlsMode::Terminate),
                    }),
                );
                if accepted && listener.attached {
                    conf.tcp.routers.extend(route_conf.tcp.routers);
                    conf.tcp.services.extend(route_conf.tcp.services);
                }

                upsert_route_condition_resolved_refs(&mut conditions, resolve_condition);
            }

            parent_statuses.push(RouteParentStatus {
                parent_ref: parent_ref.clone(),
                controller_name: CONTROLLER_NAME.to_string(),
                conditions,
            });
        }

        status::write_route_status(
            client,
            RouteKind::Tls,
            &namespace,
            &route.metadata.name,
            parent_statuses,
        )
        .await;
    }
}

/// `HostSNI` over the route hostnames, or the wildcard when none remain.
pub(crate) fn build_sni_rule(hostnames: &[String]) -> String {
    if hostnames.is_empty() {
        return "HostSNI(`*`)".to_string();
    }

    let args: Vec<String> = hostnames.iter().map(|h| format!("`{}`", h)).collect();
    format!("HostSNI({})", args.join(","))
}

fn load_tcp_route(
    client: &dyn GatewayClient,
    listener: &GatewayListener,
    route_meta: &ObjectMeta,
    rules: &[TcpRouteRule],
    rule: String,
    tls: Option<RouterTlsConfig>,
) -> (Configuration, Condition) {
    let mut conf = Configuration::default();
    let mut condition = Condition::new(
        CONDITION_RESOLVED_REFS,
        true,
        REASON_RESOLVED_REFS,
        route_meta.generation,
    );

    for (rule_index, route_rule) in rules.iter().enumerate() {
        let route_key = normalize(&format!(
            "{}-{}-{}-{}-{}",
            route_meta.namespace, route_meta.name, listener.gw_name, listener.ep_name, rule_index
        ));

        let mut wrr = TcpWeightedRoundRobin::default();
        for backend_ref in &route_rule.backend_refs {
            match resolve_tcp_backend(client, route_meta, backend_ref) {
                Ok((svc_name, addresses)) => {
                    conf.tcp.services.insert(
                        svc_name.clone(),
                        TcpService::LoadBalancer(TcpServersLoadBalancer {
                            servers: addresses
                                .into_iter()
                                .map(|address| TcpServer { address })
                                .collect(),
                        }),
                    );
                    wrr.services.push(WrrService {
                        name: svc_name,
                        weight: Some(backend_ref.weight.unwrap_or(1)),
                        status: None,
                    });
                }
                Err(err_condition) => {
                    condition = err_condition;
                }
            }
        }

        let service_name = format!("{}-wrr", route_key);
        conf.tcp
            .services
            .insert(service_name.clone(), TcpService::Weighted(wrr));

        conf.tcp.routers.insert(
            route_key.clone(),
            TcpRouter {
                rule: rule.clone(),
                rule_syntax: Some("v3".to_string()),
                entry_points: vec![listener.ep_name.clone()],
                service: service_name,
                tls: tls.clone(),
                ..Default::default()
            },
        );
    }

    (conf, condition)
}

fn resolve_tcp_backend(
    client: &dyn GatewayClient,
    route_meta: &ObjectMeta,
    backend_ref: &BackendRef,
) -> std::result::Result<(String, Vec<String>), Condition> {
    let kind = backend_ref.kind.as_deref().unwrap_or("Service");
    let group = backend_ref.group.as_deref().unwrap_or(GROUP_CORE);
    let namespace = backend_ref
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(&route_meta.namespace);

    let fail = |reason: &str, message: String| {
        Condition::new(CONDITION_RESOLVED_REFS, false, reason, route_meta.generation)
            .with_message(message)
    };

    if group != GROUP_CORE || kind != "Service" {
        return Err(fail(
            REASON_INVALID_KIND,
            format!("only Kubernetes services are supported, got {}/{}", group, kind),
        ));
    }

    let Some(port) = backend_ref.port.filter(|p| *p > 0) else {
        return Err(fail(
            REASON_UNSUPPORTED_PROTOCOL,
            "port is required".to_string(),
        ));
    };

    let Some(service) = client.get_service(namespace, &backend_ref.name) else {
        return Err(fail(REASON_BACKEND_NOT_FOUND, "service not found".to_string()));
    };
    let Some(svc_port) = service.ports.iter().find(|p| p.port == port) else {
        return Err(fail(
            REASON_BACKEND_NOT_FOUND,
            format!("service port {} not found", port),
        ));
    };

    let slices = client.list_endpoint_slices(namespace, &backend_ref.name);
    if slices.is_empty() {
        return Err(fail(
            REASON_BACKEND_NOT_FOUND,
            "endpointslices not found".to_string(),
        ));
    }

    let mut addresses = Vec::new();
    let mut seen = HashSet::new();
    for slice in &slices {
        let Some(endpoint_port) = slice
            .ports
            .iter()
            .find(|p| p.name == svc_port.name)
            .and_then(|p| p.port)
        else {
            continue;
        };

        for endpoint in &slice.endpoints {
            if !endpoint.ready.unwrap_or(false) {
                continue;
            }
            for address in &endpoint.addresses {
                if seen.insert(address.clone()) {
                    addresses.push(format!("{}:{}", address, endpoint_port));
                }
            }
        }
    }

    let svc_name = normalize(&format!("{}-{}-{}", namespace, backend_ref.name, port));
    Ok((svc_name, addresses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::client::InMemoryGatewayClient;
    use crate::gateway::tests_support::*;

    #[test]
    fn test_sni_rule() {
        assert_eq!(build_sni_rule(&[]), "HostSNI(`*`)");
        assert_eq!(
            build_sni_rule(&["a.io".to_string(), "b.io".to_string()]),
            "HostSNI(`a.io`,`b.io`)"
        );
    }

    #[tokio::test]
    async fn test_tls_route_builds_passthrough_router() {
        let client = InMemoryGatewayClient::new();
        seed_gateway_with(&client, "tls-in", 9000, |listener| {
            listener.protocol = ListenerProtocol::Tls;
            listener.tls = Some(ListenerTls {
                mode: TlsMode::Passthrough,
            });
        });
        seed_backend(&client, "default", "db", 5432, &["10.1.0.1"]);

        client.put_tls_route(TlsRoute {
            metadata: meta("default", "secure-db"),
            parent_refs: vec![parent("gw")],
            hostnames: vec!["db.example.com".to_string()],
            rules: vec![TcpRouteRule {
                backend_refs: vec![backend_ref("db", 5432)],
            }],
        });

        let provider = test_provider(client.clone());
        let conf = provider.load_configuration().await;

        assert_eq!(conf.tcp.routers.len(), 1);
        let router = conf.tcp.routers.values().next().unwrap();
        assert_eq!(router.rule, "HostSNI(`db.example.com`)");
        assert!(router.tls.as_ref().unwrap().passthrough);
        assert_eq!(router.entry_points, vec!["tcp-ep"]);

        let TcpService::Weighted(wrr) = conf.tcp.services.get(&router.service).unwrap() else {
            panic!("expected weighted TCP service")
        };
        let TcpService::LoadBalancer(lb) = conf.tcp.services.get(&wrr.services[0].name).unwrap()
        else {
            panic!("expected TCP load balancer")
        };
        assert_eq!(lb.servers[0].address, "10.1.0.1:5432");
    }

    #[tokio::test]
    async fn test_tcp_route_listener_decides() {
        let client = InMemoryGatewayClient::new();
        seed_gateway_with(&client, "raw", 9000, |listener| {
            listener.protocol = ListenerProtocol::Tcp;
        });
        seed_backend(&client, "default", "queue", 4000, &["10.1.0.2"]);

        client.put_tcp_route(TcpRoute {
            metadata: meta("default", "queue-route"),
            parent_refs: vec![parent("gw")],
            rules: vec![TcpRouteRule {
                backend_refs: vec![backend_ref("queue", 4000)],
            }],
        });

        let provider = test_provider(client.clone());
        let conf = provider.load_configuration().await;

        let router = conf.tcp.routers.values().next().unwrap();
        assert_eq!(router.rule, "HostSNI(`*`)");
    }

    #[tokio::test]
    async fn test_missing_backend_surfaces_condition() {
        let client = InMemoryGatewayClient::new();
        seed_gateway_with(&client, "raw", 9000, |listener| {
            listener.protocol = ListenerProtocol::Tcp;
        });

        client.put_tcp_route(TcpRoute {
            metadata: meta("default", "queue-route"),
            parent_refs: vec![parent("gw")],
            rules: vec![TcpRouteRule {
                backend_refs: vec![backend_ref("ghost", 4000)],
            }],
        });

        let provider = test_provider(client.clone());
        provider.load_configuration().await;

        let (_, route_status) = client
            .get_route_status(RouteKind::Tcp, "default", "queue-route")
            .unwrap();
        assert!(route_status.parents[0].conditions.iter().any(|c| {
            c.condition_type == CONDITION_RESOLVED_REFS
                && !c.status
                && c.reason == REASON_BACKEND_NOT_FOUND
        }));
    }
}
