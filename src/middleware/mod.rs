//! HTTP middlewares and the chain builder.
//!
//! The factory wraps each router's service handler with its middleware
//! list; the first listed middleware is the outermost. Chains expand
//! recursively with cycle detection, so an unresolved or self-referencing
//! chain never sends the factory into a loop.

pub mod basicauth;
pub mod brotli;
pub mod compress;

use crate::config::dynamic::{
    ErrorPage, HeaderModifier, Headers, Middleware, RequestRedirect, UrlRewrite,
};
use crate::error::{Error, Result};
use crate::http::{HttpHandler, SharedHandler};
use crate::service::ServiceManager;
use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue, HOST, LOCATION};
use hyper::{Body, Request, Response, StatusCode, Uri};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub struct MiddlewareBuilder {
    middlewares: HashMap<String, Middleware>,
}

impl MiddlewareBuilder {
    pub fn new(middlewares: HashMap<String, Middleware>) -> Self {
        Self { middlewares }
    }

    /// Wrap `handler` with the named middlewares, first name outermost.
    pub fn wrap(
        &self,
        handler: SharedHandler,
        names: &[String],
        services: &mut ServiceManager,
    ) -> Result<SharedHandler> {
        let mut visiting = Vec::new();
        self.wrap_inner(handler, names, services, &mut visiting)
    }

    fn wrap_inner(
        &self,
        handler: SharedHandler,
        names: &[String],
        services: &mut ServiceManager,
        visiting: &mut Vec<String>,
    ) -> Result<SharedHandler> {
        let mut wrapped = handler;
        for name in names.iter().rev() {
            wrapped = self.build_one(name, wrapped, services, visiting)?;
        }
        Ok(wrapped)
    }

    fn build_one(
        &self,
        name: &str,
        next: SharedHandler,
        services: &mut ServiceManager,
        visiting: &mut Vec<String>,
    ) -> Result<SharedHandler> {
        if visiting.iter().any(|n| n == name) {
            return Err(Error::reference("middleware chain cycle", name));
        }

        let middleware = self
            .middlewares
            .get(name)
            .ok_or_else(|| Error::reference("middleware not found", name))?
            .clone();

        match &middleware {
            Middleware::Compress(config) => {
                Ok(compress::CompressHandler::new(config, next)? as SharedHandler)
            }
            Middleware::Headers(config) => Ok(HeadersHandler::new(config, next)?),
            Middleware::BasicAuth(config) => Ok(basicauth::BasicAuthHandler::new(
                &config.users,
                config.realm.as_deref(),
                next,
            ) as SharedHandler),
            Middleware::Chain(chain) => {
                visiting.push(name.to_string());
                let result = self.wrap_inner(next, &chain.middlewares, services, visiting);
                visiting.pop();
                result
            }
            Middleware::Errors(config) => {
                let service = services.build(&config.service)?;
                Ok(ErrorsHandler::new(config, service, next)?)
            }
            Middleware::RequestHeaderModifier(config) => {
                Ok(Arc::new(RequestHeaderModifierHandler {
                    modifier: parse_modifier(config)?,
                    next,
                }))
            }
            Middleware::ResponseHeaderModifier(config) => {
                Ok(Arc::new(ResponseHeaderModifierHandler {
                    modifier: parse_modifier(config)?,
                    next,
                }))
            }
            Middleware::RequestRedirect(config) => Ok(Arc::new(RequestRedirectHandler {
                config: config.clone(),
            })),
            Middleware::UrlRewrite(config) => Ok(Arc::new(UrlRewriteHandler {
                config: config.clone(),
                next,
            })),
            Middleware::RequestMirror(config) => {
                let mirror = services.build(&config.service)?;
                Ok(Arc::new(RequestMirrorHandler {
                    mirror,
                    percent: config.percent.min(100),
                    sent: AtomicU64::new(0),
                    total: AtomicU64::new(0),
                    next,
                }))
            }
        }
    }
}

/// Precompiled header mutations.
struct CompiledModifier {
    set: Vec<(HeaderName, HeaderValue)>,
    add: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

fn parse_modifier(config: &HeaderModifier) -> Result<CompiledModifier> {
    let parse_pair = |(name, value): (&String, &String)| -> Result<(HeaderName, HeaderValue)> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::config(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::config(format!("invalid header value '{}': {}", value, e)))?;
        Ok((name, value))
    };

    Ok(CompiledModifier {
        set: config.set.iter().map(parse_pair).collect::<Result<_>>()?,
        add: config.add.iter().map(parse_pair).collect::<Result<_>>()?,
        remove: config
            .remove
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| Error::config(format!("invalid header name '{}': {}", name, e)))
            })
            .collect::<Result<_>>()?,
    })
}

impl CompiledModifier {
    fn apply(&self, headers: &mut hyper::HeaderMap) {
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
        for name in &self.remove {
            headers.remove(name);
        }
    }
}

struct RequestHeaderModifierHandler {
    modifier: CompiledModifier,
    next: SharedHandler,
}

#[async_trait]
impl HttpHandler for RequestHeaderModifierHandler {
    async fn handle(&self, mut req: Request<Body>) -> Response<Body> {
        self.modifier.apply(req.headers_mut());
        self.next.handle(req).await
    }
}

struct ResponseHeaderModifierHandler {
    modifier: CompiledModifier,
    next: SharedHandler,
}

#[async_trait]
impl HttpHandler for ResponseHeaderModifierHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let mut resp = self.next.handle(req).await;
        self.modifier.apply(resp.headers_mut());
        resp
    }
}

/// Custom request/response headers, the classic add/remove pair.
struct HeadersHandler {
    request: CompiledModifier,
    response: CompiledModifier,
    next: SharedHandler,
}

impl HeadersHandler {
    fn new(config: &Headers, next: SharedHandler) -> Result<SharedHandler> {
        let as_modifier = |map: &HashMap<String, String>| HeaderModifier {
            set: map.clone(),
            add: HashMap::new(),
            remove: map
                .iter()
                .filter(|(_, v)| v.is_empty())
                .map(|(k, _)| k.clone())
                .collect(),
        };

        Ok(Arc::new(Self {
            request: parse_modifier(&as_modifier(&config.custom_request_headers))?,
            response: parse_modifier(&as_modifier(&config.custom_response_headers))?,
            next,
        }))
    }
}

#[async_trait]
impl HttpHandler for HeadersHandler {
    async fn handle(&self, mut req: Request<Body>) -> Response<Body> {
        self.request.apply(req.headers_mut());
        let mut resp = self.next.handle(req).await;
        self.response.apply(resp.headers_mut());
        resp
    }
}

/// Replaces error responses in the configured status ranges with the
/// response of a dedicated error service.
struct ErrorsHandler {
    ranges: Vec<(u16, u16)>,
    query: String,
    service: SharedHandler,
    next: SharedHandler,
}

impl ErrorsHandler {
    fn new(config: &ErrorPage, service: SharedHandler, next: SharedHandler) -> Result<SharedHandler> {
        let mut ranges = Vec::new();
        for entry in &config.status {
            let range = match entry.split_once('-') {
                Some((lo, hi)) => {
                    let lo = lo.parse::<u16>();
                    let hi = hi.parse::<u16>();
                    match (lo, hi) {
                        (Ok(lo), Ok(hi)) if lo <= hi => (lo, hi),
                        _ => {
                            return Err(Error::config(format!("invalid status range '{}'", entry)))
                        }
                    }
                }
                None => {
                    let code = entry
                        .parse::<u16>()
                        .map_err(|_| Error::config(format!("invalid status code '{}'", entry)))?;
                    (code, code)
                }
            };
            ranges.push(range);
        }

        Ok(Arc::new(Self {
            ranges,
            query: config.query.clone(),
            service,
            next,
        }))
    }

    fn covers(&self, status: u16) -> bool {
        self.ranges.iter().any(|(lo, hi)| *lo <= status && status <= *hi)
    }
}

#[async_trait]
impl HttpHandler for ErrorsHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let template = clone_parts(&req);
        let resp = self.next.handle(req).await;
        let status = resp.status().as_u16();
        if !self.covers(status) {
            return resp;
        }

        let path = self.query.replace("{status}", &status.to_string());
        let path = if path.is_empty() { "/".to_string() } else { path };

        let mut error_req = template;
        *error_req.uri_mut() = path.parse().unwrap_or_else(|_| Uri::from_static("/"));

        let mut error_resp = self.service.handle(error_req).await;
        // The error page carries the original failure status.
        *error_resp.status_mut() =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        error_resp
    }
}

/// Answers a redirect built from scheme/host/port/path overrides.
struct RequestRedirectHandler {
    config: RequestRedirect,
}

#[async_trait]
impl HttpHandler for RequestRedirectHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let scheme = self.config.scheme.as_deref().unwrap_or("http");
        let host = self
            .config
            .hostname
            .clone()
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(|h| h.split(':').next().unwrap_or(h).to_string())
            })
            .unwrap_or_default();
        let port = match self.config.port {
            Some(port) => format!(":{}", port),
            None => String::new(),
        };
        let path = self
            .config
            .path
            .clone()
            .unwrap_or_else(|| req.uri().path().to_string());

        let location = format!("{}://{}{}{}", scheme, host, port, path);
        let status = self
            .config
            .status_code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::FOUND);

        match HeaderValue::from_str(&location) {
            Ok(value) => Response::builder()
                .status(status)
                .header(LOCATION, value)
                .body(Body::empty())
                .unwrap_or_default(),
            Err(e) => {
                warn!("Invalid redirect location '{}': {}", location, e);
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap_or_default()
            }
        }
    }
}

/// Rewrites hostname and path before forwarding.
struct UrlRewriteHandler {
    config: UrlRewrite,
    next: SharedHandler,
}

#[async_trait]
impl HttpHandler for UrlRewriteHandler {
    async fn handle(&self, mut req: Request<Body>) -> Response<Body> {
        if let Some(hostname) = &self.config.hostname {
            if let Ok(value) = HeaderValue::from_str(hostname) {
                req.headers_mut().insert(HOST, value);
            }
        }

        let original_path = req.uri().path().to_string();
        let new_path = if let Some(path) = &self.config.path {
            Some(path.clone())
        } else {
            self.config.path_prefix.as_ref().map(|prefix| {
                let rest = original_path
                    .strip_prefix(prefix.trim_end_matches('/'))
                    .unwrap_or(&original_path);
                let rest = if rest.starts_with('/') { rest } else { "/" };
                rest.to_string()
            })
        };

        if let Some(new_path) = new_path {
            let path_and_query = match req.uri().query() {
                Some(query) => format!("{}?{}", new_path, query),
                None => new_path,
            };
            if let Ok(uri) = path_and_query.parse::<Uri>() {
                *req.uri_mut() = uri;
            }
        }

        self.next.handle(req).await
    }
}

/// Fire-and-forget duplication of a share of requests to a mirror service.
struct RequestMirrorHandler {
    mirror: SharedHandler,
    percent: u32,
    sent: AtomicU64,
    total: AtomicU64,
    next: SharedHandler,
}

#[async_trait]
impl HttpHandler for RequestMirrorHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let (parts, body) = req.into_parts();
        let body_bytes = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap_or_default()
            }
        };

        let template = Request::from_parts(parts, Body::empty());
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let sent = self.sent.load(Ordering::Relaxed);
        if sent * 100 < u64::from(self.percent) * total {
            self.sent.fetch_add(1, Ordering::Relaxed);
            let mut mirror_req = clone_parts(&template);
            *mirror_req.body_mut() = Body::from(body_bytes.clone());
            let mirror = self.mirror.clone();
            tokio::spawn(async move {
                let _ = mirror.handle(mirror_req).await;
            });
        }

        let mut forward = clone_parts(&template);
        *forward.body_mut() = Body::from(body_bytes);
        self.next.handle(forward).await
    }
}

/// Copy method, URI, headers and connection info of a request, body left
/// empty.
fn clone_parts(req: &Request<Body>) -> Request<Body> {
    let mut builder = Request::builder().method(req.method()).uri(req.uri());
    if let Some(headers) = builder.headers_mut() {
        *headers = req.headers().clone();
    }
    let mut cloned = builder
        .body(Body::empty())
        .unwrap_or_else(|_| Request::new(Body::empty()));
    if let Some(conn) = req.extensions().get::<crate::http::ConnInfo>() {
        cloned.extensions_mut().insert(*conn);
    }
    cloned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{Chain, Service, WeightedRoundRobin, WrrService};
    use crate::http::StatusHandler;
    use crate::proxy::ReverseProxy;

    fn empty_services() -> ServiceManager {
        ServiceManager::new(HashMap::new(), Arc::new(ReverseProxy::new()), HashMap::new())
    }

    fn status_service(name: &str, status: u16) -> (String, Service) {
        (
            name.to_string(),
            Service::Weighted(WeightedRoundRobin {
                services: vec![WrrService {
                    name: "synthetic".to_string(),
                    weight: Some(1),
                    status: Some(status),
                }],
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_chain_cycle_fails_build() {
        let mut middlewares = HashMap::new();
        middlewares.insert(
            "a@file".to_string(),
            Middleware::Chain(Chain {
                middlewares: vec!["b@file".to_string()],
            }),
        );
        middlewares.insert(
            "b@file".to_string(),
            Middleware::Chain(Chain {
                middlewares: vec!["a@file".to_string()],
            }),
        );

        let builder = MiddlewareBuilder::new(middlewares);
        let result = builder.wrap(
            StatusHandler::new(StatusCode::OK),
            &["a@file".to_string()],
            &mut empty_services(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_middleware_fails_build() {
        let builder = MiddlewareBuilder::new(HashMap::new());
        let result = builder.wrap(
            StatusHandler::new(StatusCode::OK),
            &["ghost@file".to_string()],
            &mut empty_services(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_request_header_modifier() {
        struct EchoHeader;

        #[async_trait]
        impl HttpHandler for EchoHeader {
            async fn handle(&self, req: Request<Body>) -> Response<Body> {
                let value = req
                    .headers()
                    .get("X-Injected")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("missing")
                    .to_string();
                Response::new(Body::from(value))
            }
        }

        let mut middlewares = HashMap::new();
        middlewares.insert(
            "inject@file".to_string(),
            Middleware::RequestHeaderModifier(HeaderModifier {
                set: [("X-Injected".to_string(), "yes".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            }),
        );

        let builder = MiddlewareBuilder::new(middlewares);
        let handler = builder
            .wrap(
                Arc::new(EchoHeader),
                &["inject@file".to_string()],
                &mut empty_services(),
            )
            .unwrap();

        let resp = handler.handle(Request::new(Body::empty())).await;
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"yes");
    }

    #[tokio::test]
    async fn test_errors_middleware_replaces_5xx() {
        let mut middlewares = HashMap::new();
        middlewares.insert(
            "errors@file".to_string(),
            Middleware::Errors(ErrorPage {
                status: vec!["500-599".to_string()],
                service: "errpage@file".to_string(),
                query: "/error-{status}".to_string(),
            }),
        );

        let mut services = ServiceManager::new(
            [status_service("errpage@file", 200)].into_iter().collect(),
            Arc::new(ReverseProxy::new()),
            HashMap::new(),
        );

        let builder = MiddlewareBuilder::new(middlewares);
        let handler = builder
            .wrap(
                StatusHandler::new(StatusCode::BAD_GATEWAY),
                &["errors@file".to_string()],
                &mut services,
            )
            .unwrap();

        let resp = handler.handle(Request::new(Body::empty())).await;
        // The error page answers, with the original failing status.
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_request_redirect() {
        let mut middlewares = HashMap::new();
        middlewares.insert(
            "redirect@file".to_string(),
            Middleware::RequestRedirect(RequestRedirect {
                scheme: Some("https".to_string()),
                hostname: Some("secure.example.com".to_string()),
                port: None,
                path: None,
                status_code: Some(301),
            }),
        );

        let builder = MiddlewareBuilder::new(middlewares);
        let handler = builder
            .wrap(
                StatusHandler::new(StatusCode::OK),
                &["redirect@file".to_string()],
                &mut empty_services(),
            )
            .unwrap();

        let req = Request::builder()
            .uri("http://old.example.com/path")
            .header(HOST, "old.example.com")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle(req).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(LOCATION).unwrap(),
            "https://secure.example.com/path"
        );
    }

    #[tokio::test]
    async fn test_url_rewrite_strips_prefix() {
        struct EchoPath;

        #[async_trait]
        impl HttpHandler for EchoPath {
            async fn handle(&self, req: Request<Body>) -> Response<Body> {
                Response::new(Body::from(req.uri().path().to_string()))
            }
        }

        let mut middlewares = HashMap::new();
        middlewares.insert(
            "rewrite@file".to_string(),
            Middleware::UrlRewrite(UrlRewrite {
                hostname: None,
                path: None,
                path_prefix: Some("/api".to_string()),
            }),
        );

        let builder = MiddlewareBuilder::new(middlewares);
        let handler = builder
            .wrap(
                Arc::new(EchoPath),
                &["rewrite@file".to_string()],
                &mut empty_services(),
            )
            .unwrap();

        let req = Request::builder()
            .uri("http://x/api/v1/users")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle(req).await;
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"/v1/users");
    }
}
