//! Cluster-state contract for the Gateway-API translator.
//!
//! Reads come from informer-style caches and are synchronous; status writes
//! go through the API server and carry optimistic-concurrency versions so
//! the status writer can retry on conflict. The in-memory implementation
//! backs tests and embedders without a cluster.

use super::resources::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Kinds whose status the translator writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Http,
    Grpc,
    Tcp,
    Tls,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "HTTPRoute"),
            Self::Grpc => write!(f, "GRPCRoute"),
            Self::Tcp => write!(f, "TCPRoute"),
            Self::Tls => write!(f, "TLSRoute"),
        }
    }
}

/// Status write failures the writer reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// The stored version moved; fetch and retry.
    Conflict,
    NotFound,
    /// The namespace is outside the watch; fail fast.
    OutOfWatch(String),
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => write!(f, "conflicting status write"),
            Self::NotFound => write!(f, "resource not found"),
            Self::OutOfWatch(ns) => write!(f, "namespace {} is not watched", ns),
        }
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    fn list_gateway_classes(&self) -> Vec<GatewayClass>;
    fn list_gateways(&self) -> Vec<Gateway>;
    fn list_http_routes(&self) -> Vec<HttpRoute>;
    fn list_grpc_routes(&self) -> Vec<GrpcRoute>;
    fn list_tcp_routes(&self) -> Vec<TcpRoute>;
    fn list_tls_routes(&self) -> Vec<TlsRoute>;
    fn list_namespaces(&self) -> Vec<Namespace>;
    fn list_reference_grants(&self, namespace: &str) -> Vec<ReferenceGrant>;
    fn get_service(&self, namespace: &str, name: &str) -> Option<KubeService>;
    fn list_endpoint_slices(&self, namespace: &str, service_name: &str) -> Vec<EndpointSlice>;
    /// Secrets are label-filtered upstream to exclude helm-owned ones.
    fn get_secret(&self, namespace: &str, name: &str) -> Option<KubeSecret>;

    /// Current route status with its concurrency version.
    fn get_route_status(
        &self,
        kind: RouteKind,
        namespace: &str,
        name: &str,
    ) -> Option<(u64, RouteStatus)>;

    /// Replace a route status; fails with `Conflict` when the version moved.
    async fn update_route_status(
        &self,
        kind: RouteKind,
        namespace: &str,
        name: &str,
        expected_version: u64,
        status: RouteStatus,
    ) -> Result<(), StatusError>;

    fn get_gateway_status(&self, namespace: &str, name: &str) -> Option<(u64, GatewayStatus)>;

    async fn update_gateway_status(
        &self,
        namespace: &str,
        name: &str,
        expected_version: u64,
        status: GatewayStatus,
    ) -> Result<(), StatusError>;

    /// Change notification; fires on every resource mutation.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

#[derive(Default)]
struct Store {
    gateway_classes: Vec<GatewayClass>,
    gateways: Vec<Gateway>,
    http_routes: Vec<HttpRoute>,
    grpc_routes: Vec<GrpcRoute>,
    tcp_routes: Vec<TcpRoute>,
    tls_routes: Vec<TlsRoute>,
    namespaces: Vec<Namespace>,
    reference_grants: Vec<ReferenceGrant>,
    services: HashMap<(String, String), KubeService>,
    endpoint_slices: Vec<EndpointSlice>,
    secrets: HashMap<(String, String), KubeSecret>,
    route_statuses: HashMap<(RouteKind, String, String), (u64, RouteStatus)>,
    gateway_statuses: HashMap<(String, String), (u64, GatewayStatus)>,
}

/// In-memory store; the informer layer mirrors cluster state into it.
pub struct InMemoryGatewayClient {
    store: RwLock<Store>,
    change_tx: watch::Sender<u64>,
    change_rx: watch::Receiver<u64>,
}

impl InMemoryGatewayClient {
    pub fn new() -> Arc<Self> {
        let (change_tx, change_rx) = watch::channel(0);
        Arc::new(Self {
            store: RwLock::new(Store::default()),
            change_tx,
            change_rx,
        })
    }

    fn touch(&self) {
        self.change_tx.send_modify(|v| *v += 1);
    }

    pub fn put_gateway_class(&self, gateway_class: GatewayClass) {
        self.store.write().gateway_classes.push(gateway_class);
        self.touch();
    }

    pub fn put_gateway(&self, gateway: Gateway) {
        self.store.write().gateways.push(gateway);
        self.touch();
    }

    pub fn put_http_route(&self, route: HttpRoute) {
        self.store.write().http_routes.push(route);
        self.touch();
    }

    pub fn put_grpc_route(&self, route: GrpcRoute) {
        self.store.write().grpc_routes.push(route);
        self.touch();
    }

    pub fn put_tcp_route(&self, route: TcpRoute) {
        self.store.write().tcp_routes.push(route);
        self.touch();
    }

    pub fn put_tls_route(&self, route: TlsRoute) {
        self.store.write().tls_routes.push(route);
        self.touch();
    }

    pub fn put_namespace(&self, namespace: Namespace) {
        self.store.write().namespaces.push(namespace);
        self.touch();
    }

    pub fn put_reference_grant(&self, grant: ReferenceGrant) {
        self.store.write().reference_grants.push(grant);
        self.touch();
    }

    pub fn put_service(&self, service: KubeService) {
        let key = (service.metadata.namespace.clone(), service.metadata.name.clone());
        self.store.write().services.insert(key, service);
        self.touch();
    }

    pub fn put_endpoint_slice(&self, slice: EndpointSlice) {
        self.store.write().endpoint_slices.push(slice);
        self.touch();
    }

    pub fn put_secret(&self, secret: KubeSecret) {
        let key = (secret.metadata.namespace.clone(), secret.metadata.name.clone());
        self.store.write().secrets.insert(key, secret);
        self.touch();
    }

    /// Bump a route's status version without changing content, simulating a
    /// concurrent writer.
    pub fn bump_route_status_version(&self, kind: RouteKind, namespace: &str, name: &str) {
        let mut store = self.store.write();
        let entry = store
            .route_statuses
            .entry((kind, namespace.to_string(), name.to_string()))
            .or_default();
        entry.0 += 1;
    }
}

#[async_trait]
impl GatewayClient for InMemoryGatewayClient {
    fn list_gateway_classes(&self) -> Vec<GatewayClass> {
        self.store.read().gateway_classes.clone()
    }

    fn list_gateways(&self) -> Vec<Gateway> {
        self.store.read().gateways.clone()
    }

    fn list_http_routes(&self) -> Vec<HttpRoute> {
        self.store.read().http_routes.clone()
    }

    fn list_grpc_routes(&self) -> Vec<GrpcRoute> {
        self.store.read().grpc_routes.clone()
    }

    fn list_tcp_routes(&self) -> Vec<TcpRoute> {
        self.store.read().tcp_routes.clone()
    }

    fn list_tls_routes(&self) -> Vec<TlsRoute> {
        self.store.read().tls_routes.clone()
    }

    fn list_namespaces(&self) -> Vec<Namespace> {
        self.store.read().namespaces.clone()
    }

    fn list_reference_grants(&self, namespace: &str) -> Vec<ReferenceGrant> {
        self.store
            .read()
            .reference_grants
            .iter()
            .filter(|g| g.metadata.namespace == namespace)
            .cloned()
            .collect()
    }

    fn get_service(&self, namespace: &str, name: &str) -> Option<KubeService> {
        self.store
            .read()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list_endpoint_slices(&self, namespace: &str, service_name: &str) -> Vec<EndpointSlice> {
        self.store
            .read()
            .endpoint_slices
            .iter()
            .filter(|s| s.metadata.namespace == namespace && s.service_name == service_name)
            .cloned()
            .collect()
    }

    fn get_secret(&self, namespace: &str, name: &str) -> Option<KubeSecret> {
        self.store
            .read()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn get_route_status(
        &self,
        kind: RouteKind,
        namespace: &str,
        name: &str,
    ) -> Option<(u64, RouteStatus)> {
        Some(
            self.store
                .read()
                .route_statuses
                .get(&(kind, namespace.to_string(), name.to_string()))
                .cloned()
                .unwrap_or_default(),
        )
    }

    async fn update_route_status(
        &self,
        kind: RouteKind,
        namespace: &str,
        name: &str,
        expected_version: u64,
        status: RouteStatus,
    ) -> Result<(), StatusError> {
        let mut store = self.store.write();
        let entry = store
            .route_statuses
            .entry((kind, namespace.to_string(), name.to_string()))
            .or_default();
        if entry.0 != expected_version {
            return Err(StatusError::Conflict);
        }
        *entry = (expected_version + 1, status);
        Ok(())
    }

    fn get_gateway_status(&self, namespace: &str, name: &str) -> Option<(u64, GatewayStatus)> {
        Some(
            self.store
                .read()
                .gateway_statuses
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .unwrap_or_default(),
        )
    }

    async fn update_gateway_status(
        &self,
        namespace: &str,
        name: &str,
        expected_version: u64,
        status: GatewayStatus,
    ) -> Result<(), StatusError> {
        let mut store = self.store.write();
        let entry = store
            .gateway_statuses
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        if entry.0 != expected_version {
            return Err(StatusError::Conflict);
        }
        *entry = (expected_version + 1, status);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.change_rx.clone()
    }
}
