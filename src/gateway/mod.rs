//! Kubernetes Gateway-API provider.
//!
//! Lowers Gateway, HTTPRoute, GRPCRoute, TCPRoute and TLSRoute resources
//! into dynamic-configuration fragments and feeds them to the aggregator
//! like any other provider, writing acceptance and resolution conditions
//! back through the cluster-state client.

pub mod client;
pub mod grpcroute;
pub mod httproute;
pub mod resources;
pub mod status;
pub mod tcproute;

use crate::config::dynamic::{
    Configuration, Message, Server, ServersLoadBalancer, Service, WeightedRoundRobin, WrrService,
};
use crate::config::{GatewayProviderConfig, StaticConfig};
use crate::error::Result;
use crate::provider::{Provider, ShutdownSignal};
use async_trait::async_trait;
use client::GatewayClient;
use resources::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Source name under which the translator emits its fragments.
pub const GATEWAY_PROVIDER_NAME: &str = "gateway";

/// A gateway listener expanded against the static entry points.
pub struct GatewayListener {
    pub gw_name: String,
    pub gw_namespace: String,
    pub name: String,
    pub ep_name: String,
    pub protocol: ListenerProtocol,
    pub tls_mode: Option<TlsMode>,
    pub hostname: Option<String>,
    pub attached: bool,
    pub allowed_kinds: Vec<&'static str>,
    pub allowed_namespaces: AllowedNamespaces,
    pub attached_routes: AtomicU32,
}

pub enum AllowedNamespaces {
    All,
    Same,
    Selector(HashMap<String, String>),
}

pub struct GatewayProvider {
    pub(crate) client: Arc<dyn GatewayClient>,
    experimental_channel: bool,
    throttle: Option<Duration>,
    entry_point_ports: HashMap<String, u16>,
}

impl GatewayProvider {
    pub fn new(
        client: Arc<dyn GatewayClient>,
        config: &GatewayProviderConfig,
        static_config: &StaticConfig,
    ) -> Self {
        let entry_point_ports = static_config
            .entry_points
            .iter()
            .filter_map(|(name, ep)| {
                ep.address
                    .rsplit_once(':')
                    .and_then(|(_, port)| port.parse::<u16>().ok())
                    .map(|port| (name.clone(), port))
            })
            .collect();

        Self {
            client,
            experimental_channel: config.experimental_channel,
            throttle: config.throttle_ms.map(Duration::from_millis),
            entry_point_ports,
        }
    }

    /// Translate the currently observed cluster state.
    pub async fn load_configuration(&self) -> Configuration {
        let mut conf = Configuration::default();

        let our_classes: HashSet<String> = self
            .client
            .list_gateway_classes()
            .into_iter()
            .filter(|gc| gc.controller_name == CONTROLLER_NAME)
            .map(|gc| gc.metadata.name)
            .collect();

        let gateways: Vec<Gateway> = self
            .client
            .list_gateways()
            .into_iter()
            .filter(|gw| our_classes.contains(&gw.gateway_class_name))
            .collect();

        let listeners = self.expand_listeners(&gateways);

        httproute::load_http_routes(self, &listeners, &mut conf).await;
        grpcroute::load_grpc_routes(self, &listeners, &mut conf).await;
        if self.experimental_channel {
            tcproute::load_tcp_routes(self, &listeners, &mut conf).await;
            tcproute::load_tls_routes(self, &listeners, &mut conf).await;
        }

        self.write_gateway_statuses(&gateways, &listeners).await;

        conf
    }

    fn expand_listeners(&self, gateways: &[Gateway]) -> Vec<GatewayListener> {
        let mut expanded = Vec::new();

        for gateway in gateways {
            for listener in &gateway.listeners {
                let ep_name = self
                    .entry_point_ports
                    .iter()
                    .find(|(_, port)| **port == listener.port)
                    .map(|(name, _)| name.clone());

                let attached = ep_name.is_some();
                if !attached {
                    debug!(
                        gateway = gateway.metadata.name.as_str(),
                        listener = listener.name.as_str(),
                        port = listener.port,
                        "No entry point for listener port"
                    );
                }

                let allowed_kinds = match &listener.allowed_routes {
                    Some(allowed) if !allowed.kinds.is_empty() => allowed
                        .kinds
                        .iter()
                        .filter_map(|k| match k.kind.as_str() {
                            KIND_HTTP_ROUTE => Some(KIND_HTTP_ROUTE),
                            KIND_GRPC_ROUTE => Some(KIND_GRPC_ROUTE),
                            KIND_TCP_ROUTE => Some(KIND_TCP_ROUTE),
                            KIND_TLS_ROUTE => Some(KIND_TLS_ROUTE),
                            _ => None,
                        })
                        .collect(),
                    _ => default_kinds(listener.protocol),
                };

                let allowed_namespaces = match listener
                    .allowed_routes
                    .as_ref()
                    .and_then(|a| a.namespaces.as_ref())
                {
                    Some(ns) => match ns.from {
                        NamespacesFrom::All => AllowedNamespaces::All,
                        NamespacesFrom::Same => AllowedNamespaces::Same,
                        NamespacesFrom::Selector => {
                            AllowedNamespaces::Selector(ns.selector.clone())
                        }
                    },
                    None => AllowedNamespaces::Same,
                };

                expanded.push(GatewayListener {
                    gw_name: gateway.metadata.name.clone(),
                    gw_namespace: gateway.metadata.namespace.clone(),
                    name: listener.name.clone(),
                    ep_name: ep_name.unwrap_or_default(),
                    protocol: listener.protocol,
                    tls_mode: listener.tls.as_ref().map(|t| t.mode),
                    hostname: listener.hostname.clone(),
                    attached,
                    allowed_kinds,
                    allowed_namespaces,
                    attached_routes: AtomicU32::new(0),
                });
            }
        }

        expanded
    }

    async fn write_gateway_statuses(&self, gateways: &[Gateway], listeners: &[GatewayListener]) {
        for gateway in gateways {
            let listener_statuses: Vec<ListenerStatus> = listeners
                .iter()
                .filter(|l| {
                    l.gw_name == gateway.metadata.name
                        && l.gw_namespace == gateway.metadata.namespace
                })
                .map(|l| {
                    let accepted = Condition::new(
                        CONDITION_ACCEPTED,
                        l.attached,
                        if l.attached {
                            REASON_ACCEPTED
                        } else {
                            "PortUnavailable"
                        },
                        gateway.metadata.generation,
                    );
                    ListenerStatus {
                        name: l.name.clone(),
                        attached_routes: l.attached_routes.load(Ordering::Relaxed),
                        conditions: vec![accepted],
                    }
                })
                .collect();

            let conditions = vec![Condition::new(
                CONDITION_ACCEPTED,
                true,
                REASON_ACCEPTED,
                gateway.metadata.generation,
            )];

            status::write_gateway_status(
                self.client.as_ref(),
                &gateway.metadata.namespace,
                &gateway.metadata.name,
                conditions,
                listener_statuses,
            )
            .await;
        }
    }
}

fn default_kinds(protocol: ListenerProtocol) -> Vec<&'static str> {
    match protocol {
        ListenerProtocol::Http | ListenerProtocol::Https => {
            vec![KIND_HTTP_ROUTE, KIND_GRPC_ROUTE]
        }
        ListenerProtocol::Tcp => vec![KIND_TCP_ROUTE],
        ListenerProtocol::Tls => vec![KIND_TLS_ROUTE, KIND_TCP_ROUTE],
    }
}

#[async_trait]
impl Provider for GatewayProvider {
    fn name(&self) -> &str {
        GATEWAY_PROVIDER_NAME
    }

    fn throttle_duration(&self) -> Option<Duration> {
        self.throttle
    }

    async fn provide(&self, tx: mpsc::Sender<Message>, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut changes = self.client.subscribe();

        loop {
            let configuration = self.load_configuration().await;
            info!(
                http_routers = configuration.http.routers.len(),
                tcp_routers = configuration.tcp.routers.len(),
                "Gateway provider translated cluster state"
            );
            if tx
                .send(Message {
                    source_name: GATEWAY_PROVIDER_NAME.to_string(),
                    configuration,
                })
                .await
                .is_err()
            {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Whether a parentRef designates this listener's gateway and section.
pub(crate) fn match_listener(
    listener: &GatewayListener,
    route_namespace: &str,
    parent_ref: &ParentRef,
) -> bool {
    if parent_ref.group.as_deref().unwrap_or(GROUP_GATEWAY) != GROUP_GATEWAY {
        return false;
    }
    if parent_ref.kind.as_deref().unwrap_or("Gateway") != "Gateway" {
        return false;
    }

    let parent_namespace = parent_ref.namespace.as_deref().unwrap_or(route_namespace);
    if parent_namespace != listener.gw_namespace || parent_ref.name != listener.gw_name {
        return false;
    }

    if let Some(section) = &parent_ref.section_name {
        if *section != listener.name {
            return false;
        }
    }

    true
}

/// Listener-side admission: kind allowance plus namespace filter.
pub(crate) fn allow_route(
    client: &dyn GatewayClient,
    listener: &GatewayListener,
    route_namespace: &str,
    kind: &str,
) -> bool {
    if !listener.allowed_kinds.iter().any(|k| *k == kind) {
        return false;
    }

    match &listener.allowed_namespaces {
        AllowedNamespaces::All => true,
        AllowedNamespaces::Same => route_namespace == listener.gw_namespace,
        AllowedNamespaces::Selector(selector) => client
            .list_namespaces()
            .iter()
            .filter(|ns| ns.metadata.name == route_namespace)
            .any(|ns| {
                selector
                    .iter()
                    .all(|(k, v)| ns.metadata.labels.get(k) == Some(v))
            }),
    }
}

/// Intersect the listener hostname with the route hostnames. Wildcard
/// listener hostnames admit any subdomain.
pub(crate) fn find_matching_hostnames(
    listener_hostname: Option<&str>,
    route_hostnames: &[String],
) -> (Vec<String>, bool) {
    let Some(listener_hostname) = listener_hostname.filter(|h| !h.is_empty()) else {
        return (route_hostnames.to_vec(), true);
    };

    if route_hostnames.is_empty() {
        return (vec![listener_hostname.to_string()], true);
    }

    let mut matching = Vec::new();
    for hostname in route_hostnames {
        if hostname == listener_hostname {
            matching.push(hostname.clone());
            continue;
        }

        if let Some(domain) = listener_hostname.strip_prefix("*.") {
            if hostname
                .strip_suffix(domain)
                .map(|prefix| prefix.ends_with('.') && prefix.len() > 1)
                .unwrap_or(false)
            {
                matching.push(hostname.clone());
                continue;
            }
        }

        if let Some(domain) = hostname.strip_prefix("*.") {
            if listener_hostname
                .strip_suffix(domain)
                .map(|prefix| prefix.ends_with('.') && prefix.len() > 1)
                .unwrap_or(false)
            {
                matching.push(listener_hostname.to_string());
            }
        }
    }

    let ok = !matching.is_empty();
    (matching, ok)
}

/// Render a Host rule. The returned priority is the length of the longest
/// hostname, so longer literal matches outrank shorter ones.
pub(crate) fn build_host_rule(hostnames: &[String]) -> (Option<String>, i64) {
    let priority = hostnames.iter().map(|h| h.len() as i64).max().unwrap_or(0);

    let mut rules: Vec<String> = Vec::new();
    for hostname in hostnames {
        if let Some(domain) = hostname.strip_prefix("*.") {
            let pattern = format!("^[a-z0-9]([a-z0-9-]*[a-z0-9])?\\.{}$", regex_escape(domain));
            rules.push(format!("HostRegexp(`{}`)", pattern));
        } else {
            rules.push(format!("Host(`{}`)", hostname));
        }
    }

    match rules.len() {
        0 => (None, 0),
        1 => (Some(rules.remove(0)), priority),
        _ => (Some(format!("({})", rules.join(" || "))), priority),
    }
}

fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

/// Flatten a resource name into the dynamic-configuration namespace.
pub(crate) fn normalize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Resolve one backendRef into a load-balancer service. On failure a
/// condition explains the reason and the caller synthesizes a 500 backend.
pub(crate) fn load_backend_service(
    client: &dyn GatewayClient,
    route_kind: &str,
    route_meta: &ObjectMeta,
    backend_ref: &BackendRef,
    scheme: &str,
) -> (String, Option<Service>, Option<Condition>) {
    let kind = backend_ref.kind.as_deref().unwrap_or("Service");
    let group = backend_ref.group.as_deref().unwrap_or(GROUP_CORE);
    let namespace = backend_ref
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(&route_meta.namespace);

    let service_name = normalize(&format!("{}-{}", namespace, backend_ref.name));

    let fail = |reason: &str, message: String| {
        Condition::new(CONDITION_RESOLVED_REFS, false, reason, route_meta.generation)
            .with_message(message)
    };

    if namespace != route_meta.namespace
        && !is_reference_granted(client, route_kind, &route_meta.namespace, group, kind, &backend_ref.name, namespace)
    {
        return (
            service_name,
            None,
            Some(fail(
                REASON_REF_NOT_PERMITTED,
                format!(
                    "Cannot load {} {}/{}/{}/{}: no matching ReferenceGrant",
                    route_kind, group, kind, namespace, backend_ref.name
                ),
            )),
        );
    }

    if group != GROUP_CORE || kind != "Service" {
        return (
            service_name,
            None,
            Some(fail(
                REASON_INVALID_KIND,
                format!(
                    "Cannot load {} {}/{}/{}/{}: only Kubernetes services are supported",
                    route_kind, group, kind, namespace, backend_ref.name
                ),
            )),
        );
    }

    let Some(port) = backend_ref.port.filter(|p| *p > 0) else {
        return (
            service_name,
            None,
            Some(fail(
                REASON_UNSUPPORTED_PROTOCOL,
                format!(
                    "Cannot load {} {}/{}/{}/{}: port is required",
                    route_kind, group, kind, namespace, backend_ref.name
                ),
            )),
        );
    };

    let service_name = normalize(&format!("{}-{}", service_name, port));

    match load_servers(client, namespace, &backend_ref.name, port, scheme) {
        Ok(lb) => (service_name, Some(Service::LoadBalancer(lb)), None),
        Err(message) => (
            service_name,
            None,
            Some(fail(
                REASON_BACKEND_NOT_FOUND,
                format!(
                    "Cannot load {} {}/{}/{}/{}: {}",
                    route_kind, group, kind, namespace, backend_ref.name, message
                ),
            )),
        ),
    }
}

fn is_reference_granted(
    client: &dyn GatewayClient,
    route_kind: &str,
    route_namespace: &str,
    group: &str,
    kind: &str,
    name: &str,
    target_namespace: &str,
) -> bool {
    client
        .list_reference_grants(target_namespace)
        .iter()
        .any(|grant| {
            let from_ok = grant.from.iter().any(|from| {
                from.group == GROUP_GATEWAY
                    && from.kind == route_kind
                    && from.namespace == route_namespace
            });
            let to_ok = grant.to.iter().any(|to| {
                to.group == group
                    && to.kind == kind
                    && to.name.as_deref().map(|n| n == name).unwrap_or(true)
            });
            from_ok && to_ok
        })
}

/// Draw the server list from the target service's ready EndpointSlices,
/// resolving the named port on both sides and deduplicating addresses.
fn load_servers(
    client: &dyn GatewayClient,
    namespace: &str,
    name: &str,
    port: u16,
    scheme: &str,
) -> std::result::Result<ServersLoadBalancer, String> {
    let Some(service) = client.get_service(namespace, name) else {
        return Err("service not found".to_string());
    };

    let Some(svc_port) = service.ports.iter().find(|p| p.port == port) else {
        return Err(format!("service port {} not found", port));
    };

    let slices = client.list_endpoint_slices(namespace, name);
    if slices.is_empty() {
        return Err("endpointslices not found".to_string());
    }

    let mut lb = ServersLoadBalancer::default();
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
                if !seen.insert(address.clone()) {
                    continue;
                }
                lb.servers.push(Server {
                    url: format!("{}://{}:{}", scheme, address, endpoint_port),
                });
            }
        }
    }

    Ok(lb)
}

/// Expand backendRefs into one weighted service; unresolved refs become a
/// synthesized 500 child and surface as a single condition.
pub(crate) fn load_wrr_service(
    client: &dyn GatewayClient,
    conf: &mut Configuration,
    route_kind: &str,
    route_meta: &ObjectMeta,
    route_key: &str,
    backend_refs: &[BackendRef],
    scheme: &str,
) -> (String, Option<Condition>) {
    let name = format!("{}-wrr", route_key);
    if conf.http.services.contains_key(&name) {
        return (name, None);
    }

    let mut wrr = WeightedRoundRobin::default();
    let mut condition = None;

    for backend_ref in backend_refs {
        let weight = Some(backend_ref.weight.unwrap_or(1));
        let (svc_name, service, err_condition) =
            load_backend_service(client, route_kind, route_meta, backend_ref, scheme);

        if let Some(err_condition) = err_condition {
            condition = Some(err_condition);
            wrr.services.push(WrrService {
                name: svc_name,
                weight,
                status: Some(500),
            });
            continue;
        }

        if let Some(service) = service {
            conf.http.services.insert(svc_name.clone(), service);
        }
        wrr.services.push(WrrService {
            name: svc_name,
            weight,
            status: None,
        });
    }

    conf.http
        .services
        .insert(name.clone(), Service::Weighted(wrr));
    (name, condition)
}

/// Replace or append the Accepted condition with the given reason.
pub(crate) fn update_route_condition_accepted(
    conditions: &mut Vec<Condition>,
    generation: i64,
    reason: &str,
) {
    conditions.retain(|c| c.condition_type != CONDITION_ACCEPTED);
    conditions.push(Condition::new(
        CONDITION_ACCEPTED,
        reason == REASON_ACCEPTED,
        reason,
        generation,
    ));
}

/// Keep the most recent ResolvedRefs failure, or the success condition.
pub(crate) fn upsert_route_condition_resolved_refs(
    conditions: &mut Vec<Condition>,
    condition: Condition,
) {
    conditions.retain(|c| c.condition_type != CONDITION_RESOLVED_REFS);
    conditions.push(condition);
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::client::InMemoryGatewayClient;
    use super::resources::*;
    use super::GatewayProvider;
    use crate::config::{
        EntryPointConfig, EntryPointProtocol, GatewayProviderConfig, ProvidersConfig, StaticConfig,
    };
    use std::collections::HashMap;
    use std::sync::Arc;

    pub(crate) fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            generation: 1,
            labels: HashMap::new(),
        }
    }

    pub(crate) fn parent(name: &str) -> ParentRef {
        ParentRef {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn backend_ref(name: &str, port: u16) -> BackendRef {
        BackendRef {
            name: name.to_string(),
            port: Some(port),
            ..Default::default()
        }
    }

    pub(crate) fn seed_gateway(client: &InMemoryGatewayClient, listener_name: &str, port: u16) {
        seed_gateway_with(client, listener_name, port, |_| {});
    }

    pub(crate) fn seed_gateway_with(
        client: &InMemoryGatewayClient,
        listener_name: &str,
        port: u16,
        tweak: impl FnOnce(&mut Listener),
    ) {
        client.put_gateway_class(GatewayClass {
            metadata: meta("", "fluxgate"),
            controller_name: CONTROLLER_NAME.to_string(),
        });

        let mut listener = Listener {
            name: listener_name.to_string(),
            port,
            protocol: ListenerProtocol::Http,
            hostname: None,
            tls: None,
            allowed_routes: Some(AllowedRoutes {
                namespaces: Some(RouteNamespaces {
                    from: NamespacesFrom::All,
                    selector: HashMap::new(),
                }),
                kinds: vec![],
            }),
        };
        tweak(&mut listener);

        client.put_gateway(Gateway {
            metadata: meta("default", "gw"),
            gateway_class_name: "fluxgate".to_string(),
            listeners: vec![listener],
        });
    }

    pub(crate) fn seed_backend(
        client: &InMemoryGatewayClient,
        namespace: &str,
        name: &str,
        port: u16,
        addresses: &[&str],
    ) {
        client.put_service(KubeService {
            metadata: meta(namespace, name),
            ports: vec![ServicePort {
                name: Some("p".to_string()),
                port,
            }],
        });
        client.put_endpoint_slice(EndpointSlice {
            metadata: meta(namespace, &format!("{}-abc", name)),
            service_name: name.to_string(),
            ports: vec![EndpointPort {
                name: Some("p".to_string()),
                port: Some(port),
            }],
            endpoints: vec![Endpoint {
                addresses: addresses.iter().map(|a| a.to_string()).collect(),
                ready: Some(true),
            }],
        });
    }

    pub(crate) fn test_provider(client: Arc<InMemoryGatewayClient>) -> GatewayProvider {
        let mut entry_points = HashMap::new();
        entry_points.insert(
            "web".to_string(),
            EntryPointConfig {
                address: "0.0.0.0:80".to_string(),
                protocol: EntryPointProtocol::Tcp,
            },
        );
        entry_points.insert(
            "tcp-ep".to_string(),
            EntryPointConfig {
                address: "0.0.0.0:9000".to_string(),
                protocol: EntryPointProtocol::Tcp,
            },
        );

        let static_config = StaticConfig {
            entry_points,
            providers: ProvidersConfig::default(),
            default_entry_points: vec![],
            api: false,
        };

        GatewayProvider::new(
            client,
            &GatewayProviderConfig {
                experimental_channel: true,
                label_selector: None,
                namespaces: vec![],
                throttle_ms: None,
            },
            &static_config,
        )
    }
}
