//! Dynamic configuration model.
//!
//! The plain-data tree describing routers, services, middlewares, TLS
//! material and per-entry-point models, for HTTP/TCP/UDP. Everything is a
//! value: deep copy is `Clone`, structural equality is `PartialEq`, and
//! every type round-trips through serde so providers can ship fragments in
//! YAML or JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of the TLS store with default-resolution semantics.
pub const DEFAULT_TLS_STORE_NAME: &str = "default";

/// Name of the TLS options entry with default-resolution semantics.
pub const DEFAULT_TLS_OPTIONS_NAME: &str = "default";

/// ALPN protocol tag used by the TLS-ALPN-01 challenge. Certificates kept
/// in this store are only admitted from the internal ACME source.
pub const ACME_TLS1_PROTOCOL: &str = "acme-tls/1";

/// A configuration fragment as emitted by one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default)]
    pub http: HttpConfiguration,
    #[serde(default)]
    pub tcp: TcpConfiguration,
    #[serde(default)]
    pub udp: UdpConfiguration,
    #[serde(default)]
    pub tls: TlsConfiguration,
}

/// A tagged configuration message flowing from a provider to the watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub source_name: String,
    pub configuration: Configuration,
}

/// Last message per source, as held by the watcher.
pub type Configurations = HashMap<String, Configuration>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfiguration {
    #[serde(default)]
    pub routers: HashMap<String, Router>,
    #[serde(default)]
    pub middlewares: HashMap<String, Middleware>,
    #[serde(default)]
    pub services: HashMap<String, Service>,
    #[serde(default)]
    pub models: HashMap<String, Model>,
    #[serde(default)]
    pub servers_transports: HashMap<String, ServersTransport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TcpConfiguration {
    #[serde(default)]
    pub routers: HashMap<String, TcpRouter>,
    #[serde(default)]
    pub middlewares: HashMap<String, TcpMiddleware>,
    #[serde(default)]
    pub services: HashMap<String, TcpService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UdpConfiguration {
    #[serde(default)]
    pub routers: HashMap<String, UdpRouter>,
    #[serde(default)]
    pub services: HashMap<String, UdpService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfiguration {
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
    #[serde(default)]
    pub stores: HashMap<String, TlsStore>,
    #[serde(default)]
    pub options: HashMap<String, TlsOptions>,
}

/// An HTTP router: a rule, the entry points it listens on, the service it
/// targets and the middleware chain wrapped around that service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub rule: String,
    #[serde(default)]
    pub rule_syntax: Option<String>,
    #[serde(default)]
    pub entry_points: Vec<String>,
    pub service: String,
    #[serde(default)]
    pub middlewares: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub tls: Option<RouterTlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RouterTlsConfig {
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub passthrough: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouter {
    pub rule: String,
    #[serde(default)]
    pub rule_syntax: Option<String>,
    #[serde(default)]
    pub entry_points: Vec<String>,
    pub service: String,
    #[serde(default)]
    pub middlewares: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub tls: Option<RouterTlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UdpRouter {
    #[serde(default)]
    pub entry_points: Vec<String>,
    pub service: String,
}

/// HTTP service kinds. Every composite leaf terminates in a `LoadBalancer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Service {
    LoadBalancer(ServersLoadBalancer),
    Weighted(WeightedRoundRobin),
    Mirroring(Mirroring),
    Failover(Failover),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServersLoadBalancer {
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub sticky: Option<Sticky>,
    #[serde(default)]
    pub health_check: Option<ServerHealthCheck>,
    #[serde(default)]
    pub servers_transport: String,
    #[serde(default)]
    pub pass_host_header: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Sticky {
    pub cookie: StickyCookie,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StickyCookie {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealthCheck {
    pub path: String,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WeightedRoundRobin {
    #[serde(default)]
    pub services: Vec<WrrService>,
    #[serde(default)]
    pub sticky: Option<Sticky>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WrrService {
    pub name: String,
    #[serde(default)]
    pub weight: Option<u32>,
    /// Fixed status answered instead of forwarding; used for synthesized
    /// failure backends.
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Mirroring {
    pub service: String,
    #[serde(default)]
    pub mirrors: Vec<MirrorService>,
    #[serde(default)]
    pub max_body_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MirrorService {
    pub name: String,
    #[serde(default)]
    pub percent: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Failover {
    pub service: String,
    pub fallback: String,
}

/// TCP service kinds (no mirroring).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TcpService {
    LoadBalancer(TcpServersLoadBalancer),
    Weighted(TcpWeightedRoundRobin),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TcpServersLoadBalancer {
    #[serde(default)]
    pub servers: Vec<TcpServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TcpServer {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TcpWeightedRoundRobin {
    #[serde(default)]
    pub services: Vec<WrrService>,
}

/// UDP service kinds (no mirroring).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UdpService {
    LoadBalancer(UdpServersLoadBalancer),
    Weighted(UdpWeightedRoundRobin),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UdpServersLoadBalancer {
    #[serde(default)]
    pub servers: Vec<UdpServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UdpServer {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UdpWeightedRoundRobin {
    #[serde(default)]
    pub services: Vec<WrrService>,
}

/// HTTP middleware kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Middleware {
    Compress(Compress),
    Headers(Headers),
    BasicAuth(BasicAuth),
    Chain(Chain),
    Errors(ErrorPage),
    RequestHeaderModifier(HeaderModifier),
    ResponseHeaderModifier(HeaderModifier),
    RequestRedirect(RequestRedirect),
    UrlRewrite(UrlRewrite),
    RequestMirror(RequestMirror),
}

/// TCP middleware kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TcpMiddleware {
    InFlightConn(InFlightConn),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InFlightConn {
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Compress {
    #[serde(default)]
    pub excluded_content_types: Vec<String>,
    #[serde(default)]
    pub min_response_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    #[serde(default)]
    pub custom_request_headers: HashMap<String, String>,
    #[serde(default)]
    pub custom_response_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    /// `user:hash` entries, htpasswd formats.
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub realm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    #[serde(default)]
    pub middlewares: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPage {
    /// Status ranges such as `500-599` or single codes.
    #[serde(default)]
    pub status: Vec<String>,
    pub service: String,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeaderModifier {
    #[serde(default)]
    pub set: HashMap<String, String>,
    #[serde(default)]
    pub add: HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestRedirect {
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UrlRewrite {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestMirror {
    pub service: String,
    #[serde(default)]
    pub percent: u32,
}

/// Per-entry-point overrides applied to every router entering that entry
/// point during model expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[serde(default)]
    pub middlewares: Vec<String>,
    #[serde(default)]
    pub tls: Option<RouterTlsConfig>,
}

/// Transport options applied when dialing the servers of a load balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServersTransport {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub max_idle_conns_per_host: Option<usize>,
    #[serde(default)]
    pub idle_conn_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateConfig {
    pub cert_file: String,
    pub key_file: String,
    #[serde(default)]
    pub stores: Vec<String>,
}

impl CertificateConfig {
    /// Whether this certificate is tagged for the ACME-TLS/1 store.
    pub fn is_acme_tls1(&self) -> bool {
        self.stores.iter().any(|s| s == ACME_TLS1_PROTOCOL)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TlsStore {
    #[serde(default)]
    pub default_certificate: Option<CertificateConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub max_version: Option<String>,
    #[serde(default)]
    pub alpn_protocols: Vec<String>,
    #[serde(default)]
    pub sni_strict: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_copy_and_equality() {
        let mut conf = Configuration::default();
        conf.http.routers.insert(
            "web".to_string(),
            Router {
                rule: "Host(`example.com`)".to_string(),
                entry_points: vec!["web".to_string()],
                service: "backend".to_string(),
                ..Default::default()
            },
        );
        conf.http.services.insert(
            "backend".to_string(),
            Service::LoadBalancer(ServersLoadBalancer {
                servers: vec![Server {
                    url: "http://127.0.0.1:8080".to_string(),
                }],
                ..Default::default()
            }),
        );

        let copy = conf.clone();
        assert_eq!(conf, copy);

        let mut modified = copy.clone();
        modified
            .http
            .routers
            .get_mut("web")
            .unwrap()
            .entry_points
            .push("websecure".to_string());
        assert_ne!(conf, modified);
        // The original is untouched by mutation of the copy.
        assert_eq!(conf.http.routers["web"].entry_points, vec!["web"]);
    }

    #[test]
    fn test_service_round_trip() {
        let yaml = r#"
loadBalancer:
  servers:
    - url: "http://10.0.0.1:80"
  sticky:
    cookie:
      name: "lb"
"#;
        let service: Service = serde_yaml::from_str(yaml).unwrap();
        match &service {
            Service::LoadBalancer(lb) => {
                assert_eq!(lb.servers.len(), 1);
                assert_eq!(lb.sticky.as_ref().unwrap().cookie.name, "lb");
            }
            other => panic!("unexpected service kind: {:?}", other),
        }

        let printed = serde_yaml::to_string(&service).unwrap();
        let reparsed: Service = serde_yaml::from_str(&printed).unwrap();
        assert_eq!(service, reparsed);
    }

    #[test]
    fn test_acme_tls1_detection() {
        let cert = CertificateConfig {
            cert_file: "cert.pem".to_string(),
            key_file: "key.pem".to_string(),
            stores: vec![ACME_TLS1_PROTOCOL.to_string()],
        };
        assert!(cert.is_acme_tls1());
    }
}
