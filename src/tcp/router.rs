//! Per-entry-point TCP demultiplexing.
//!
//! The first bytes of every accepted connection are sniffed: TLS
//! connections are matched on {SNI, ALPN, peer IP} against the TCP routers;
//! passthrough routers stream the raw bytes to their service, terminating
//! routers decrypt and feed the HTTP handler, and unmatched TLS falls back
//! to plain HTTPS termination. Non-TLS connections either match a TCP
//! router or are served as clear-text HTTP.

use super::clienthello::{looks_like_tls, parse_client_hello, record_length};
use super::{PrefixedStream, TcpServiceHandler};
use crate::config::dynamic::RouterTlsConfig;
use crate::http::router::HttpRouterTable;
use crate::http::ConnInfo;
use crate::rule::matcher::{ConnMeta, MatcherTree, TcpMatcher};
use crate::tls::TlsManager;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HELLO_SIZE: usize = 16 * 1024;

pub struct CompiledTcpRoute {
    pub name: String,
    pub priority: i64,
    pub matcher: MatcherTree<TcpMatcher>,
    pub tls: Option<RouterTlsConfig>,
    pub service: Option<Arc<TcpServiceHandler>>,
}

pub struct TcpRouterTable {
    routes: Vec<CompiledTcpRoute>,
    tls_manager: Arc<TlsManager>,
    http_handler: Arc<HttpRouterTable>,
}

impl TcpRouterTable {
    pub fn new(
        mut routes: Vec<CompiledTcpRoute>,
        tls_manager: Arc<TlsManager>,
        http_handler: Arc<HttpRouterTable>,
    ) -> Arc<Self> {
        routes.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Arc::new(Self {
            routes,
            tls_manager,
            http_handler,
        })
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn find_route(&self, meta: &ConnMeta) -> Option<&CompiledTcpRoute> {
        self.routes.iter().find(|r| r.matcher.matches(meta))
    }

    /// Handle one accepted connection.
    pub async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (prefix, stream) = match sniff(stream).await {
            Some(parts) => parts,
            None => return,
        };

        let hello = parse_client_hello(&prefix);
        let meta = ConnMeta {
            sni: hello.server_name.clone(),
            alpn: hello.alpn_protocols.clone(),
            peer_ip: Some(peer.ip()),
        };

        let client = PrefixedStream::new(prefix, stream);

        if hello.is_tls {
            match self.find_route(&meta) {
                Some(route) => {
                    let passthrough = route.tls.as_ref().map(|t| t.passthrough).unwrap_or(false);
                    if passthrough {
                        self.proxy_raw(route, client).await;
                        return;
                    }

                    let options = route
                        .tls
                        .as_ref()
                        .map(|t| t.options.clone())
                        .unwrap_or_default();
                    match self.terminate(client, &options).await {
                        Some(decrypted) => {
                            // Decrypted traffic goes to this entry point's
                            // HTTP handler.
                            serve_http(decrypted, self.http_handler.clone(), peer).await;
                        }
                        None => {}
                    }
                }
                None => {
                    // No TCP route: plain HTTPS for the HTTP routers.
                    if let Some(decrypted) = self.terminate(client, "").await {
                        serve_http(decrypted, self.http_handler.clone(), peer).await;
                    }
                }
            }
            return;
        }

        // Clear text: a matching TCP router wins, else serve HTTP.
        match self.find_route(&meta) {
            Some(route) if route.tls.is_none() => {
                self.proxy_raw(route, client).await;
            }
            _ => {
                serve_http(client, self.http_handler.clone(), peer).await;
            }
        }
    }

    async fn proxy_raw<S>(&self, route: &CompiledTcpRoute, client: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(service) = &route.service else {
            debug!(router = route.name.as_str(), "TCP router has no resolvable service");
            return;
        };
        if let Err(e) = service.proxy(client).await {
            debug!(router = route.name.as_str(), "TCP proxy error: {}", e);
        }
    }

    async fn terminate<S>(
        &self,
        client: S,
        options: &str,
    ) -> Option<tokio_rustls::server::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(acceptor) = self.tls_manager.acceptor(options) else {
            warn!(options, "No TLS configuration available, dropping connection");
            return None;
        };

        match acceptor.accept(client).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!("TLS handshake failed: {}", e);
                None
            }
        }
    }
}

/// Read the first bytes of the stream: enough to decide TLS-or-not, and for
/// TLS the complete first record so the ClientHello parses whole.
async fn sniff(mut stream: TcpStream) -> Option<(Vec<u8>, TcpStream)> {
    let mut buffer = Vec::with_capacity(1536);
    let mut chunk = [0u8; 4096];

    let result = timeout(SNIFF_TIMEOUT, async {
        loop {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return if buffer.is_empty() { None } else { Some(()) };
            }
            buffer.extend_from_slice(&chunk[..n]);

            if buffer.len() >= 3 && !looks_like_tls(&buffer) {
                return Some(());
            }
            if let Some(record_len) = record_length(&buffer) {
                if buffer.len() >= record_len || buffer.len() >= MAX_HELLO_SIZE {
                    return Some(());
                }
            }
        }
    })
    .await;

    match result {
        Ok(Some(())) => Some((buffer, stream)),
        _ => None,
    }
}

/// Serve HTTP over an (optionally decrypted) byte stream.
pub async fn serve_http<S>(stream: S, handler: Arc<HttpRouterTable>, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut req: Request<Body>| {
        let handler = handler.clone();
        req.extensions_mut().insert(ConnInfo { peer });
        async move { Ok::<_, Infallible>(handler.dispatch(req).await) }
    });

    if let Err(e) = Http::new()
        .serve_connection(stream, service)
        .with_upgrades()
        .await
    {
        debug!(peer = %peer, "HTTP connection error: {}", e);
    }
}
