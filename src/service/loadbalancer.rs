//! Weighted round-robin load balancing over backend servers.

use crate::config::dynamic::{ServersLoadBalancer, StickyCookie};
use crate::http::HttpHandler;
use crate::proxy::ReverseProxy;
use async_trait::async_trait;
use hyper::header::{HeaderValue, COOKIE, SET_COOKIE};
use hyper::{Body, Request, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One backend server with its runtime health flag.
pub struct ServerEntry {
    pub url: String,
    pub weight: u32,
    up: AtomicBool,
    /// Stable identifier carried in sticky cookies.
    cookie_value: String,
}

impl ServerEntry {
    pub fn new(url: String, weight: u32) -> Arc<Self> {
        let cookie_value = hash_server_url(&url);
        Arc::new(Self {
            url,
            weight: weight.max(1),
            up: AtomicBool::new(true),
            cookie_value,
        })
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }
}

fn hash_server_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// HTTP load balancer: weighted round-robin over healthy servers, optional
/// sticky cookie pinning. Zero healthy servers answer 503.
pub struct LoadBalancerHandler {
    name: String,
    servers: Vec<Arc<ServerEntry>>,
    counter: AtomicUsize,
    sticky: Option<StickyCookie>,
    pass_host_header: bool,
    proxy: Arc<ReverseProxy>,
}

impl LoadBalancerHandler {
    pub fn new(name: String, config: &ServersLoadBalancer, proxy: Arc<ReverseProxy>) -> Arc<Self> {
        let servers = config
            .servers
            .iter()
            .map(|s| ServerEntry::new(s.url.clone(), 1))
            .collect();

        Arc::new(Self {
            name,
            servers,
            counter: AtomicUsize::new(0),
            sticky: config.sticky.as_ref().map(|s| {
                let mut cookie = s.cookie.clone();
                if cookie.name.is_empty() {
                    cookie.name = "fluxgate".to_string();
                }
                cookie
            }),
            pass_host_header: config.pass_host_header.unwrap_or(true),
            proxy,
        })
    }

    pub fn servers(&self) -> &[Arc<ServerEntry>] {
        &self.servers
    }

    /// Whether at least one server currently passes health checks.
    pub fn has_healthy_server(&self) -> bool {
        self.servers.iter().any(|s| s.is_up())
    }

    /// Weighted round-robin over healthy servers.
    fn select_server(&self) -> Option<Arc<ServerEntry>> {
        let healthy: Vec<_> = self.servers.iter().filter(|s| s.is_up()).collect();
        if healthy.is_empty() {
            return None;
        }

        let total_weight: usize = healthy.iter().map(|s| s.weight as usize).sum();
        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total_weight;
        for server in healthy {
            let weight = server.weight as usize;
            if slot < weight {
                return Some(server.clone());
            }
            slot -= weight;
        }
        None
    }

    /// Server pinned by the sticky cookie, when it is still healthy.
    fn sticky_server(&self, req: &Request<Body>) -> Option<Arc<ServerEntry>> {
        let cookie = self.sticky.as_ref()?;
        let header = req.headers().get(COOKIE)?.to_str().ok()?;

        let wanted = header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == cookie.name).then(|| value.to_string())
        })?;

        self.servers
            .iter()
            .find(|s| s.cookie_value == wanted && s.is_up())
            .cloned()
    }

    fn set_cookie(&self, resp: &mut Response<Body>, server: &ServerEntry) {
        let Some(cookie) = &self.sticky else { return };

        let mut value = format!("{}={}; Path=/", cookie.name, server.cookie_value);
        if cookie.http_only {
            value.push_str("; HttpOnly");
        }
        if cookie.secure {
            value.push_str("; Secure");
        }
        if let Ok(value) = HeaderValue::from_str(&value) {
            resp.headers_mut().append(SET_COOKIE, value);
        }
    }
}

#[async_trait]
impl HttpHandler for LoadBalancerHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let server = match self.sticky_server(&req).or_else(|| self.select_server()) {
            Some(server) => server,
            None => {
                debug!(service = self.name.as_str(), "No available server");
                return Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Body::from("Service Unavailable"))
                    .unwrap_or_default();
            }
        };

        match self
            .proxy
            .forward(&server.url, req, self.pass_host_header)
            .await
        {
            Ok(mut resp) => {
                self.set_cookie(&mut resp, &server);
                resp
            }
            Err(e) => {
                warn!(
                    service = self.name.as_str(),
                    server = server.url.as_str(),
                    "Upstream request failed: {}",
                    e
                );
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(Body::from("Bad Gateway"))
                    .unwrap_or_default()
            }
        }
    }
}
