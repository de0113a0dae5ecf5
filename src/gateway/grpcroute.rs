//! GRPCRoute translation.
//!
//! GRPC method matches render as `PathRegexp` over `/service/method` with
//! `[^/]+` standing in for missing parts; backends resolve to `h2c` server
//! URLs. Only the `Exact` method match type is honoured.

use super::client::RouteKind;
use super::httproute::{build_header_rules, load_filter_middlewares};
use super::resources::*;
use super::{
    allow_route, build_host_rule, find_matching_hostnames, load_wrr_service, match_listener,
    normalize, status, update_route_condition_accepted, upsert_route_condition_resolved_refs,
    GatewayListener, GatewayProvider,
};
use crate::config::dynamic::{
    Configuration, RouterTlsConfig, Service, WeightedRoundRobin, WrrService,
};
use std::sync::atomic::Ordering;
use tracing::error;

pub(crate) async fn load_grpc_routes(
    provider: &GatewayProvider,
    listeners: &[GatewayListener],
    conf: &mut Configuration,
) {
    let client = provider.client.as_ref();

    for route in client.list_grpc_routes() {
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
                if !allow_route(client, listener, &namespace, KIND_GRPC_ROUTE) {
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

                let (route_conf, resolve_condition) =
                    load_grpc_route(provider, listener, &route, &hostnames);
                if accepted && listener.attached {
                    conf.http.routers.extend(route_conf.http.routers);
                    conf.http.middlewares.extend(route_conf.http.middlewares);
                    conf.http.services.extend(route_conf.http.services);
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
            RouteKind::Grpc,
            &namespace,
            &route.metadata.name,
            parent_statuses,
        )
        .await;
    }
}

fn load_grpc_route(
    provider: &GatewayProvider,
    listener: &GatewayListener,
    route: &GrpcRoute,
    hostnames: &[String],
) -> (Configuration, Condition) {
    let client = provider.client.as_ref();
    let mut conf = Configuration::default();
    let mut condition = Condition::new(
        CONDITION_RESOLVED_REFS,
        true,
        REASON_RESOLVED_REFS,
        route.metadata.generation,
    );

    for (rule_index, route_rule) in route.rules.iter().enumerate() {
        let route_key = normalize(&format!(
            "{}-{}-{}-{}-{}",
            route.metadata.namespace, route.metadata.name, listener.gw_name, listener.ep_name, rule_index
        ));

        let default_match = [GrpcRouteMatch::default()];
        let matches: &[GrpcRouteMatch] = if route_rule.matches.is_empty() {
            &default_match
        } else {
            &route_rule.matches
        };

        for (match_index, route_match) in matches.iter().enumerate() {
            let (rule, priority) = build_grpc_match_rule(hostnames, route_match);

            let router_name = format!("{}-{}", route_key, match_index);
            let mut router = crate::config::dynamic::Router {
                rule,
                rule_syntax: Some("v3".to_string()),
                entry_points: vec![listener.ep_name.clone()],
                priority: Some(priority),
                ..Default::default()
            };
            if listener.protocol == ListenerProtocol::Https {
                router.tls = Some(RouterTlsConfig::default());
            }

            match load_filter_middlewares(
                client,
                &mut conf,
                &route.metadata,
                &router_name,
                &route_rule.filters,
            ) {
                Ok(middlewares) => {
                    router.middlewares = middlewares;
                    let (service_name, service_condition) = load_wrr_service(
                        client,
                        &mut conf,
                        KIND_GRPC_ROUTE,
                        &route.metadata,
                        &route_key,
                        &route_rule.backend_refs,
                        "h2c",
                    );
                    router.service = service_name;
                    if let Some(service_condition) = service_condition {
                        condition = service_condition;
                    }
                }
                Err(e) => {
                    error!(route = route.metadata.name.as_str(), "Unable to load GRPC route filters: {}", e);
                    let err_name = format!("{}-err-wrr", router_name);
                    conf.http.services.insert(
                        err_name.clone(),
                        Service::Weighted(WeightedRoundRobin {
                            services: vec![WrrService {
                                name: "invalid-grpcroute-filter".to_string(),
                                weight: Some(1),
                                status: Some(500),
                            }],
                            ..Default::default()
                        }),
                    );
                    router.service = err_name;
                }
            }

            conf.http.routers.insert(router_name, router);
        }
    }

    (conf, condition)
}

/// Combine Host, method and header matches into a rule string with the
/// hostname-weighted priority.
pub(crate) fn build_grpc_match_rule(
    hostnames: &[String],
    route_match: &GrpcRouteMatch,
) -> (String, i64) {
    let mut match_rules = vec![build_grpc_method_rule(route_match.method.as_ref())];
    match_rules.extend(build_header_rules(&route_match.headers));

    let match_rules_str = match_rules.join(" && ");

    let (host_rule, host_priority) = build_host_rule(hostnames);
    match host_rule {
        None => {
            let priority = match_rules_str.len() as i64;
            (match_rules_str, priority)
        }
        Some(host_rule) => (
            format!("{} && {}", host_rule, match_rules_str),
            host_priority + match_rules_str.len() as i64,
        ),
    }
}

/// Render the method match as a path pattern; `[^/]+` fills missing parts.
/// Match types other than `Exact` fall back to the exact rendering.
fn build_grpc_method_rule(method: Option<&GrpcMethodMatch>) -> String {
    let Some(method) = method else {
        return "PathPrefix(`/`)".to_string();
    };

    let service = method.service.as_deref().filter(|s| !s.is_empty());
    let name = method.method.as_deref().filter(|m| !m.is_empty());
    if service.is_none() && name.is_none() {
        return "PathPrefix(`/`)".to_string();
    }

    format!(
        "PathRegexp(`/{}/{}`)",
        service.unwrap_or("[^/]+"),
        name.unwrap_or("[^/]+")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::client::InMemoryGatewayClient;
    use crate::gateway::tests_support::*;

    struct Case {
        desc: &'static str,
        hostnames: Vec<&'static str>,
        route_match: GrpcRouteMatch,
        expected_rule: &'static str,
        expected_priority: i64,
    }

    fn method(service: Option<&str>, name: Option<&str>, match_type: Option<GrpcMethodMatchType>) -> GrpcMethodMatch {
        GrpcMethodMatch {
            match_type,
            service: service.map(String::from),
            method: name.map(String::from),
        }
    }

    fn header(match_type: HeaderMatchType, name: &str, value: &str) -> HeaderMatch {
        HeaderMatch {
            match_type,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_build_grpc_match_rule() {
        let cases = vec![
            Case {
                desc: "empty rule and matches",
                hostnames: vec![],
                route_match: GrpcRouteMatch::default(),
                expected_rule: "PathPrefix(`/`)",
                expected_priority: 15,
            },
            Case {
                desc: "one host rule without match",
                hostnames: vec!["foo.com"],
                route_match: GrpcRouteMatch::default(),
                expected_rule: "Host(`foo.com`) && PathPrefix(`/`)",
                expected_priority: 22,
            },
            Case {
                desc: "method match with nil values",
                hostnames: vec![],
                route_match: GrpcRouteMatch {
                    method: Some(method(None, None, None)),
                    headers: vec![],
                },
                expected_rule: "PathPrefix(`/`)",
                expected_priority: 15,
            },
            Case {
                desc: "only service",
                hostnames: vec![],
                route_match: GrpcRouteMatch {
                    method: Some(method(Some("foobar"), None, None)),
                    headers: vec![],
                },
                expected_rule: "PathRegexp(`/foobar/[^/]+`)",
                expected_priority: 27,
            },
            Case {
                desc: "only service with regex match type falls back to exact",
                hostnames: vec![],
                route_match: GrpcRouteMatch {
                    method: Some(method(
                        Some("foobar"),
                        None,
                        Some(GrpcMethodMatchType::RegularExpression),
                    )),
                    headers: vec![],
                },
                expected_rule: "PathRegexp(`/foobar/[^/]+`)",
                expected_priority: 27,
            },
            Case {
                desc: "service and hostname",
                hostnames: vec!["foo.com"],
                route_match: GrpcRouteMatch {
                    method: Some(method(Some("foobar"), None, None)),
                    headers: vec![],
                },
                expected_rule: "Host(`foo.com`) && PathRegexp(`/foobar/[^/]+`)",
                expected_priority: 34,
            },
            Case {
                desc: "only method",
                hostnames: vec![],
                route_match: GrpcRouteMatch {
                    method: Some(method(None, Some("foobar"), None)),
                    headers: vec![],
                },
                expected_rule: "PathRegexp(`/[^/]+/foobar`)",
                expected_priority: 27,
            },
            Case {
                desc: "service and method",
                hostnames: vec![],
                route_match: GrpcRouteMatch {
                    method: Some(method(Some("foobar"), Some("foobar"), None)),
                    headers: vec![],
                },
                expected_rule: "PathRegexp(`/foobar/foobar`)",
                expected_priority: 28,
            },
            Case {
                desc: "service, method and hostname",
                hostnames: vec!["foo.com"],
                route_match: GrpcRouteMatch {
                    method: Some(method(Some("foobar"), Some("foobar"), None)),
                    headers: vec![],
                },
                expected_rule: "Host(`foo.com`) && PathRegexp(`/foobar/foobar`)",
                expected_priority: 35,
            },
            Case {
                desc: "one header",
                hostnames: vec![],
                route_match: GrpcRouteMatch {
                    method: None,
                    headers: vec![header(HeaderMatchType::Exact, "foo", "bar")],
                },
                expected_rule: "PathPrefix(`/`) && Header(`foo`,`bar`)",
                expected_priority: 38,
            },
            Case {
                desc: "one regex header",
                hostnames: vec![],
                route_match: GrpcRouteMatch {
                    method: None,
                    headers: vec![header(HeaderMatchType::RegularExpression, "foo", "bar")],
                },
                expected_rule: "PathPrefix(`/`) && HeaderRegexp(`foo`,`bar`)",
                expected_priority: 44,
            },
            Case {
                desc: "header and hostname",
                hostnames: vec!["foo.com"],
                route_match: GrpcRouteMatch {
                    method: None,
                    headers: vec![header(HeaderMatchType::Exact, "foo", "bar")],
                },
                expected_rule: "Host(`foo.com`) && PathPrefix(`/`) && Header(`foo`,`bar`)",
                expected_priority: 45,
            },
            Case {
                desc: "multiple headers",
                hostnames: vec![],
                route_match: GrpcRouteMatch {
                    method: None,
                    headers: vec![
                        header(HeaderMatchType::Exact, "foo", "bar"),
                        header(HeaderMatchType::Exact, "foo2", "bar2"),
                    ],
                },
                expected_rule: "PathPrefix(`/`) && Header(`foo`,`bar`) && Header(`foo2`,`bar2`)",
                expected_priority: 63,
            },
        ];

        for case in cases {
            let hostnames: Vec<String> = case.hostnames.iter().map(|h| h.to_string()).collect();
            let (rule, priority) = build_grpc_match_rule(&hostnames, &case.route_match);
            assert_eq!(rule, case.expected_rule, "{}", case.desc);
            assert_eq!(priority, case.expected_priority, "{}", case.desc);
        }
    }

    #[tokio::test]
    async fn test_grpc_backends_use_h2c() {
        let client = InMemoryGatewayClient::new();
        seed_gateway(&client, "web", 80);
        seed_backend(&client, "default", "grpc-svc", 9090, &["10.0.0.5"]);
        client.put_grpc_route(GrpcRoute {
            metadata: meta("default", "rpc"),
            parent_refs: vec![parent("gw")],
            hostnames: vec![],
            rules: vec![GrpcRouteRule {
                matches: vec![GrpcRouteMatch {
                    method: Some(method(Some("users"), Some("Get"), None)),
                    headers: vec![],
                }],
                filters: vec![],
                backend_refs: vec![backend_ref("grpc-svc", 9090)],
            }],
        });

        let provider = test_provider(client.clone());
        let conf = provider.load_configuration().await;

        let router = conf.http.routers.values().next().unwrap();
        assert_eq!(router.rule, "PathRegexp(`/users/Get`)");

        let crate::config::dynamic::Service::Weighted(wrr) =
            conf.http.services.get(&router.service).unwrap()
        else {
            panic!("expected weighted service")
        };
        let crate::config::dynamic::Service::LoadBalancer(lb) =
            conf.http.services.get(&wrr.services[0].name).unwrap()
        else {
            panic!("expected load balancer leaf")
        };
        assert_eq!(lb.servers[0].url, "h2c://10.0.0.5:9090");
    }
}
