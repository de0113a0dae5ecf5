//! HTTPRoute translation.

use super::client::RouteKind;
use super::resources::*;
use super::{
    allow_route, build_host_rule, find_matching_hostnames, load_backend_service, load_wrr_service,
    match_listener, normalize, status, update_route_condition_accepted,
    upsert_route_condition_resolved_refs, GatewayListener, GatewayProvider,
};
use crate::config::dynamic::{
    Configuration, HeaderModifier, Middleware, RequestMirror, RequestRedirect, RouterTlsConfig,
    Service, UrlRewrite, WeightedRoundRobin, WrrService,
};
use crate::error::{Error, Result};
use std::sync::atomic::Ordering;
use tracing::error;

pub(crate) async fn load_http_routes(
    provider: &GatewayProvider,
    listeners: &[GatewayListener],
    conf: &mut Configuration,
) {
    let client = provider.client.as_ref();

    for route in client.list_http_routes() {
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
                if !allow_route(client, listener, &namespace, KIND_HTTP_ROUTE) {
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
                    // AttachedRoutes counts even when the gateway itself has
                    // unresolved refs.
                    listener.attached_routes.fetch_add(1, Ordering::Relaxed);
                    if listener.attached {
                        update_route_condition_accepted(&mut conditions, generation, REASON_ACCEPTED);
                    }
                }

                let (route_conf, resolve_condition) =
                    load_http_route(provider, listener, &route, &hostnames);
                if accepted && listener.attached {
                    merge_http_fragment(route_conf, conf);
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
            RouteKind::Http,
            &namespace,
            &route.metadata.name,
            parent_statuses,
        )
        .await;
    }
}

fn load_http_route(
    provider: &GatewayProvider,
    listener: &GatewayListener,
    route: &HttpRoute,
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
        // The gateway and entry point names prevent routers built from the
        // same route overlapping.
        let route_key = normalize(&format!(
            "{}-{}-{}-{}-{}",
            route.metadata.namespace, route.metadata.name, listener.gw_name, listener.ep_name, rule_index
        ));

        let default_match = [HttpRouteMatch::default()];
        let matches: &[HttpRouteMatch] = if route_rule.matches.is_empty() {
            &default_match
        } else {
            &route_rule.matches
        };

        for (match_index, route_match) in matches.iter().enumerate() {
            let (rule, priority) = build_http_match_rule(hostnames, route_match);

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
                        KIND_HTTP_ROUTE,
                        &route.metadata,
                        &route_key,
                        &route_rule.backend_refs,
                        "http",
                    );
                    router.service = service_name;
                    if let Some(service_condition) = service_condition {
                        condition = service_condition;
                    }
                }
                Err(e) => {
                    error!(route = route.metadata.name.as_str(), "Unable to load route filters: {}", e);
                    let err_name = format!("{}-err-wrr", router_name);
                    conf.http.services.insert(
                        err_name.clone(),
                        Service::Weighted(WeightedRoundRobin {
                            services: vec![WrrService {
                                name: "invalid-httproute-filter".to_string(),
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

/// Combine Host, Path, Method, Headers and QueryParams into a rule string.
/// The priority is the hostname weight plus the match-rule length.
pub(crate) fn build_http_match_rule(
    hostnames: &[String],
    route_match: &HttpRouteMatch,
) -> (String, i64) {
    let mut match_rules = Vec::new();

    let default_path = HttpPathMatch {
        match_type: PathMatchType::PathPrefix,
        value: "/".to_string(),
    };
    let path = route_match.path.as_ref().unwrap_or(&default_path);
    match_rules.push(match path.match_type {
        PathMatchType::Exact => format!("Path(`{}`)", path.value),
        PathMatchType::PathPrefix => format!("PathPrefix(`{}`)", path.value),
        PathMatchType::RegularExpression => format!("PathRegexp(`{}`)", path.value),
    });

    if let Some(method) = &route_match.method {
        match_rules.push(format!("Method(`{}`)", method.to_ascii_uppercase()));
    }

    match_rules.extend(build_header_rules(&route_match.headers));

    for query in &route_match.query_params {
        match query.match_type {
            HeaderMatchType::Exact => {
                match_rules.push(format!("Query(`{}`,`{}`)", query.name, query.value))
            }
            HeaderMatchType::RegularExpression => {
                match_rules.push(format!("QueryRegexp(`{}`,`{}`)", query.name, query.value))
            }
        }
    }

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

pub(crate) fn build_header_rules(headers: &[HeaderMatch]) -> Vec<String> {
    headers
        .iter()
        .map(|header| match header.match_type {
            HeaderMatchType::Exact => {
                format!("Header(`{}`,`{}`)", header.name, header.value)
            }
            HeaderMatchType::RegularExpression => {
                format!("HeaderRegexp(`{}`,`{}`)", header.name, header.value)
            }
        })
        .collect()
}

/// Turn route filters into middlewares attached in declared order.
pub(crate) fn load_filter_middlewares(
    client: &dyn super::client::GatewayClient,
    conf: &mut Configuration,
    route_meta: &ObjectMeta,
    router_name: &str,
    filters: &[RouteFilter],
) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for (index, filter) in filters.iter().enumerate() {
        match filter {
            RouteFilter::RequestHeaderModifier(modifier) => {
                let name = format!("{}-requestheadermodifier-{}", router_name, index);
                conf.http.middlewares.insert(
                    name.clone(),
                    Middleware::RequestHeaderModifier(to_header_modifier(modifier)),
                );
                names.push(name);
            }
            RouteFilter::ResponseHeaderModifier(modifier) => {
                let name = format!("{}-responseheadermodifier-{}", router_name, index);
                conf.http.middlewares.insert(
                    name.clone(),
                    Middleware::ResponseHeaderModifier(to_header_modifier(modifier)),
                );
                names.push(name);
            }
            RouteFilter::RequestRedirect(redirect) => {
                let name = format!("{}-requestredirect-{}", router_name, index);
                conf.http.middlewares.insert(
                    name.clone(),
                    Middleware::RequestRedirect(RequestRedirect {
                        scheme: redirect.scheme.clone(),
                        hostname: redirect.hostname.clone(),
                        port: redirect.port,
                        path: redirect.path.clone(),
                        status_code: redirect.status_code,
                    }),
                );
                names.push(name);
            }
            RouteFilter::UrlRewrite(rewrite) => {
                let name = format!("{}-urlrewrite-{}", router_name, index);
                conf.http.middlewares.insert(
                    name.clone(),
                    Middleware::UrlRewrite(UrlRewrite {
                        hostname: rewrite.hostname.clone(),
                        path: rewrite.path.clone(),
                        path_prefix: rewrite.path_prefix.clone(),
                    }),
                );
                names.push(name);
            }
            RouteFilter::RequestMirror(mirror) => {
                let (svc_name, service, err_condition) = load_backend_service(
                    client,
                    KIND_HTTP_ROUTE,
                    route_meta,
                    &mirror.backend,
                    "http",
                );
                if let Some(err_condition) = err_condition {
                    return Err(Error::gateway(
                        format!("mirror backend unresolved: {}", err_condition.message),
                        router_name,
                    ));
                }
                if let Some(service) = service {
                    conf.http.services.insert(svc_name.clone(), service);
                }

                let name = format!("{}-requestmirror-{}", router_name, index);
                conf.http.middlewares.insert(
                    name.clone(),
                    Middleware::RequestMirror(RequestMirror {
                        service: svc_name,
                        percent: mirror.percent.unwrap_or(100),
                    }),
                );
                names.push(name);
            }
            RouteFilter::ExtensionRef(extension) => {
                // The referenced middleware is supplied by another source;
                // the factory answers 503 when it never materializes.
                names.push(normalize(&format!(
                    "{}-{}",
                    route_meta.namespace, extension.name
                )));
            }
        }
    }

    Ok(names)
}

fn to_header_modifier(filter: &FilterHeaderModifier) -> HeaderModifier {
    HeaderModifier {
        set: filter.set.clone(),
        add: filter.add.clone(),
        remove: filter.remove.clone(),
    }
}

fn merge_http_fragment(fragment: Configuration, conf: &mut Configuration) {
    conf.http.routers.extend(fragment.http.routers);
    conf.http.middlewares.extend(fragment.http.middlewares);
    conf.http.services.extend(fragment.http.services);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::Service as DynService;
    use crate::gateway::client::{GatewayClient, InMemoryGatewayClient};
    use crate::gateway::tests_support::*;

    #[test]
    fn test_match_rule_defaults_to_path_prefix() {
        let (rule, priority) = build_http_match_rule(&[], &HttpRouteMatch::default());
        assert_eq!(rule, "PathPrefix(`/`)");
        assert_eq!(priority, 15);
    }

    #[test]
    fn test_match_rule_with_host_and_path() {
        let route_match = HttpRouteMatch {
            path: Some(HttpPathMatch {
                match_type: PathMatchType::Exact,
                value: "/v1".to_string(),
            }),
            ..Default::default()
        };
        let (rule, priority) =
            build_http_match_rule(&["foo.com".to_string()], &route_match);
        assert_eq!(rule, "Host(`foo.com`) && Path(`/v1`)");
        assert_eq!(priority, 7 + "Path(`/v1`)".len() as i64);
    }

    #[test]
    fn test_match_rule_full_house() {
        let route_match = HttpRouteMatch {
            path: Some(HttpPathMatch {
                match_type: PathMatchType::PathPrefix,
                value: "/api".to_string(),
            }),
            headers: vec![HeaderMatch {
                match_type: HeaderMatchType::Exact,
                name: "x-env".to_string(),
                value: "prod".to_string(),
            }],
            query_params: vec![QueryParamMatch {
                match_type: HeaderMatchType::RegularExpression,
                name: "v".to_string(),
                value: "^2|3$".to_string(),
            }],
            method: Some("get".to_string()),
        };
        let (rule, _) = build_http_match_rule(&[], &route_match);
        assert_eq!(
            rule,
            "PathPrefix(`/api`) && Method(`GET`) && Header(`x-env`,`prod`) && QueryRegexp(`v`,`^2|3$`)"
        );
        // The generated rule is valid DSL.
        crate::rule::matcher::compile_http(&crate::rule::parse(&rule).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_http_route_translated_to_router_and_service() {
        let client = InMemoryGatewayClient::new();
        seed_gateway(&client, "web", 80);
        seed_backend(&client, "default", "whoami", 8080, &["10.0.0.1", "10.0.0.2"]);
        client.put_http_route(HttpRoute {
            metadata: meta("default", "app"),
            parent_refs: vec![parent("gw")],
            hostnames: vec!["app.example.com".to_string()],
            rules: vec![HttpRouteRule {
                matches: vec![],
                filters: vec![],
                backend_refs: vec![backend_ref("whoami", 8080)],
            }],
        });

        let provider = test_provider(client.clone());
        let conf = provider.load_configuration().await;

        assert_eq!(conf.http.routers.len(), 1);
        let router = conf.http.routers.values().next().unwrap();
        assert_eq!(router.rule, "Host(`app.example.com`) && PathPrefix(`/`)");
        assert_eq!(router.priority, Some(15 + 15));
        assert_eq!(router.entry_points, vec!["web"]);

        // The wrr service exists and its leaf load balancer carries both
        // ready endpoints.
        let wrr = conf.http.services.get(&router.service).unwrap();
        let DynService::Weighted(wrr) = wrr else {
            panic!("expected weighted service")
        };
        let leaf_name = &wrr.services[0].name;
        let DynService::LoadBalancer(lb) = conf.http.services.get(leaf_name).unwrap() else {
            panic!("expected load balancer leaf")
        };
        let mut urls: Vec<_> = lb.servers.iter().map(|s| s.url.clone()).collect();
        urls.sort();
        assert_eq!(urls, vec!["http://10.0.0.1:8080", "http://10.0.0.2:8080"]);

        // Accepted + ResolvedRefs are written back.
        let (_, route_status) = client
            .get_route_status(super::RouteKind::Http, "default", "app")
            .unwrap();
        let conditions = &route_status.parents[0].conditions;
        assert!(conditions
            .iter()
            .any(|c| c.condition_type == CONDITION_ACCEPTED && c.status));
        assert!(conditions
            .iter()
            .any(|c| c.condition_type == CONDITION_RESOLVED_REFS && c.status));
    }

    #[tokio::test]
    async fn test_unresolved_backend_becomes_500_and_condition() {
        let client = InMemoryGatewayClient::new();
        seed_gateway(&client, "web", 80);
        client.put_http_route(HttpRoute {
            metadata: meta("default", "app"),
            parent_refs: vec![parent("gw")],
            hostnames: vec![],
            rules: vec![HttpRouteRule {
                matches: vec![],
                filters: vec![],
                backend_refs: vec![backend_ref("ghost", 8080)],
            }],
        });

        let provider = test_provider(client.clone());
        let conf = provider.load_configuration().await;

        let router = conf.http.routers.values().next().unwrap();
        let DynService::Weighted(wrr) = conf.http.services.get(&router.service).unwrap() else {
            panic!("expected weighted service")
        };
        assert_eq!(wrr.services[0].status, Some(500));

        let (_, route_status) = client
            .get_route_status(super::RouteKind::Http, "default", "app")
            .unwrap();
        let conditions = &route_status.parents[0].conditions;
        assert!(conditions.iter().any(|c| {
            c.condition_type == CONDITION_RESOLVED_REFS
                && !c.status
                && c.reason == REASON_BACKEND_NOT_FOUND
        }));
    }

    #[tokio::test]
    async fn test_cross_namespace_requires_reference_grant() {
        let client = InMemoryGatewayClient::new();
        seed_gateway(&client, "web", 80);
        seed_backend(&client, "other", "db", 5432, &["10.0.0.9"]);

        let mut backend = backend_ref("db", 5432);
        backend.namespace = Some("other".to_string());
        client.put_http_route(HttpRoute {
            metadata: meta("default", "app"),
            parent_refs: vec![parent("gw")],
            hostnames: vec![],
            rules: vec![HttpRouteRule {
                matches: vec![],
                filters: vec![],
                backend_refs: vec![backend],
            }],
        });

        let provider = test_provider(client.clone());
        provider.load_configuration().await;

        let (_, route_status) = client
            .get_route_status(super::RouteKind::Http, "default", "app")
            .unwrap();
        assert!(route_status.parents[0].conditions.iter().any(|c| {
            c.condition_type == CONDITION_RESOLVED_REFS
                && !c.status
                && c.reason == REASON_REF_NOT_PERMITTED
        }));

        // Granting the reference resolves it.
        client.put_reference_grant(ReferenceGrant {
            metadata: meta("other", "allow-default"),
            from: vec![GrantFrom {
                group: GROUP_GATEWAY.to_string(),
                kind: KIND_HTTP_ROUTE.to_string(),
                namespace: "default".to_string(),
            }],
            to: vec![GrantTo {
                group: GROUP_CORE.to_string(),
                kind: "Service".to_string(),
                name: None,
            }],
        });

        let conf = provider.load_configuration().await;
        let router = conf.http.routers.values().next().unwrap();
        let DynService::Weighted(wrr) = conf.http.services.get(&router.service).unwrap() else {
            panic!("expected weighted service")
        };
        assert_eq!(wrr.services[0].status, None);
    }

    #[tokio::test]
    async fn test_listener_kind_disallowance_sets_condition() {
        let client = InMemoryGatewayClient::new();
        // Listener that only allows GRPCRoute.
        seed_gateway_with(&client, "web", 80, |listener| {
            listener.allowed_routes = Some(AllowedRoutes {
                namespaces: None,
                kinds: vec![RouteGroupKind {
                    group: None,
                    kind: KIND_GRPC_ROUTE.to_string(),
                }],
            });
        });
        client.put_http_route(HttpRoute {
            metadata: meta("default", "app"),
            parent_refs: vec![parent("gw")],
            hostnames: vec![],
            rules: vec![],
        });

        let provider = test_provider(client.clone());
        let conf = provider.load_configuration().await;
        assert!(conf.http.routers.is_empty());

        let (_, route_status) = client
            .get_route_status(super::RouteKind::Http, "default", "app")
            .unwrap();
        assert!(route_status.parents[0].conditions.iter().any(|c| {
            c.condition_type == CONDITION_ACCEPTED
                && !c.status
                && c.reason == REASON_NOT_ALLOWED_BY_LISTENERS
        }));
    }

    #[tokio::test]
    async fn test_hostname_mismatch_sets_condition() {
        let client = InMemoryGatewayClient::new();
        seed_gateway_with(&client, "web", 80, |listener| {
            listener.hostname = Some("only.example.com".to_string());
        });
        client.put_http_route(HttpRoute {
            metadata: meta("default", "app"),
            parent_refs: vec![parent("gw")],
            hostnames: vec!["other.io".to_string()],
            rules: vec![],
        });

        let provider = test_provider(client.clone());
        provider.load_configuration().await;

        let (_, route_status) = client
            .get_route_status(super::RouteKind::Http, "default", "app")
            .unwrap();
        assert!(route_status.parents[0].conditions.iter().any(|c| {
            c.condition_type == CONDITION_ACCEPTED
                && !c.status
                && c.reason == REASON_NO_MATCHING_LISTENER_HOSTNAME
        }));
    }
}
