//! Reverse proxying towards backend servers.
//!
//! Plain-HTTP and h2c targets go through per-authority connection pools;
//! HTTPS targets go through a shared pooling client with rustls roots, the
//! same construction the front door uses for TLS.

pub mod pool;

use crate::error::{Error, NetworkErrorKind, Result};
use crate::http::ConnInfo;
use dashmap::DashMap;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Body, Client, Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use pool::ConnPool;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_IDLE_CONNS: usize = 100;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Headers stripped before forwarding, per RFC 7230 §6.1.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ReverseProxy {
    pools: DashMap<String, Arc<ConnPool>>,
    https_client: Client<HttpsConnector<HttpConnector>, Body>,
    max_idle_conns: usize,
    idle_timeout: Duration,
}

impl ReverseProxy {
    pub fn new() -> Self {
        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let https_client = Client::builder()
            .pool_idle_timeout(DEFAULT_IDLE_TIMEOUT)
            .pool_max_idle_per_host(DEFAULT_MAX_IDLE_CONNS)
            .build(https_connector);

        Self {
            pools: DashMap::new(),
            https_client,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Forward the request to the server at `target_url`
    /// (`scheme://host:port`), preserving path and query.
    pub async fn forward(
        &self,
        target_url: &str,
        mut req: Request<Body>,
        pass_host_header: bool,
    ) -> Result<Response<Body>> {
        let target: Uri = target_url
            .parse()
            .map_err(|e| Error::config(format!("invalid server URL '{}': {}", target_url, e)))?;

        let scheme = target.scheme_str().unwrap_or("http").to_string();
        let authority = target
            .authority()
            .ok_or_else(|| Error::config(format!("server URL '{}' has no authority", target_url)))?
            .to_string();

        prepare_headers(&mut req, &authority, pass_host_header)?;

        match scheme.as_str() {
            "https" => {
                *req.uri_mut() = build_absolute_uri(&scheme, &authority, req.uri())?;
                let resp = self.https_client.request(req).await?;
                Ok(resp)
            }
            "http" | "h2c" => {
                let h2c = scheme == "h2c";
                let pool = self.pool_for(&scheme, &authority, h2c);
                if h2c {
                    // HTTP/2 wants the absolute form; keep the http scheme
                    // on the wire.
                    *req.uri_mut() = build_absolute_uri("http", &authority, req.uri())?;
                } else {
                    *req.uri_mut() = build_origin_uri(req.uri())?;
                }

                let mut conn = pool.acquire().await?;
                let resp = conn.send_request(req).await.map_err(|e| {
                    Error::network(
                        format!("request to '{}' failed: {}", authority, e),
                        NetworkErrorKind::ConnectionFailed,
                    )
                })?;
                pool.release(conn);
                Ok(resp)
            }
            other => Err(Error::config(format!(
                "unsupported upstream scheme '{}'",
                other
            ))),
        }
    }

    fn pool_for(&self, scheme: &str, authority: &str, h2c: bool) -> Arc<ConnPool> {
        let key = format!("{}://{}", scheme, authority);
        self.pools
            .entry(key)
            .or_insert_with(|| {
                ConnPool::new(
                    authority.to_string(),
                    h2c,
                    self.max_idle_conns,
                    self.idle_timeout,
                )
            })
            .clone()
    }
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

fn prepare_headers(req: &mut Request<Body>, authority: &str, pass_host_header: bool) -> Result<()> {
    let peer = req.extensions().get::<ConnInfo>().map(|c| c.peer);

    let headers = req.headers_mut();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }

    if let Some(peer) = peer {
        let forwarded_for = HeaderName::from_static("x-forwarded-for");
        let peer_ip = peer.ip().to_string();
        let value = match headers.get(&forwarded_for).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, peer_ip),
            None => peer_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(forwarded_for, value);
        }
    }

    if !pass_host_header {
        let value = HeaderValue::from_str(authority)
            .map_err(|e| Error::config(format!("invalid upstream authority: {}", e)))?;
        headers.insert(HOST, value);
    }

    Ok(())
}

fn build_absolute_uri(scheme: &str, authority: &str, original: &Uri) -> Result<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", scheme, authority, path_and_query)
        .parse()
        .map_err(|e| Error::internal(format!("failed to build upstream URI: {}", e)))
}

fn build_origin_uri(original: &Uri) -> Result<Uri> {
    original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .map_err(|e| Error::internal(format!("failed to build origin-form URI: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    async fn spawn_echo_upstream() -> SocketAddr {
        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
                let body = format!(
                    "{} {} host={}",
                    req.method(),
                    req.uri(),
                    req.headers()
                        .get(HOST)
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("-"),
                );
                Ok::<_, Infallible>(Response::new(Body::from(body)))
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn test_forward_rewrites_host_and_keeps_path() {
        let addr = spawn_echo_upstream().await;
        let proxy = ReverseProxy::new();

        let req = Request::builder()
            .uri("http://front.example/api/v1?x=1")
            .header(HOST, "front.example")
            .body(Body::empty())
            .unwrap();

        let resp = proxy
            .forward(&format!("http://{}", addr), req, false)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("/api/v1?x=1"), "body: {}", body);
        assert!(body.contains(&format!("host={}", addr)), "body: {}", body);
    }

    #[tokio::test]
    async fn test_forward_preserves_host_when_asked() {
        let addr = spawn_echo_upstream().await;
        let proxy = ReverseProxy::new();

        let req = Request::builder()
            .uri("http://front.example/")
            .header(HOST, "front.example")
            .body(Body::empty())
            .unwrap();

        let resp = proxy
            .forward(&format!("http://{}", addr), req, true)
            .await
            .unwrap();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("host=front.example"), "body: {}", body);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_a_network_error() {
        let proxy = ReverseProxy::new();
        let req = Request::builder()
            .uri("http://front.example/")
            .body(Body::empty())
            .unwrap();
        let err = proxy
            .forward("http://127.0.0.1:1", req, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }
}
