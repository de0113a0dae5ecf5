//! Ordered HTTP request dispatch.
//!
//! Routers sharing an entry point are ordered by (priority desc, name asc);
//! matching stops at the first hit and falls through to 404.

use super::{ConnInfo, HttpHandler, SharedHandler, StatusHandler};
use crate::rule::matcher::{HttpMatcher, HttpRequestMeta, MatcherTree};
use async_trait::async_trait;
use hyper::{Body, Request, Response};
use std::sync::Arc;

pub struct CompiledHttpRoute {
    pub name: String,
    pub priority: i64,
    pub matcher: MatcherTree<HttpMatcher>,
    pub handler: SharedHandler,
}

pub struct HttpRouterTable {
    routes: Vec<CompiledHttpRoute>,
    fallback: SharedHandler,
}

impl HttpRouterTable {
    pub fn new(mut routes: Vec<CompiledHttpRoute>) -> Self {
        routes.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Self {
            routes,
            fallback: StatusHandler::not_found(),
        }
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::new(Vec::new()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route names in dispatch order, for introspection.
    pub fn route_names(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.name.as_str()).collect()
    }

    pub async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        let client_ip = req.extensions().get::<ConnInfo>().map(|c| c.peer.ip());
        let meta = HttpRequestMeta::from_request(&req, client_ip);

        for route in &self.routes {
            if route.matcher.matches(&meta) {
                return route.handler.handle(req).await;
            }
        }

        self.fallback.handle(req).await
    }
}

#[async_trait]
impl HttpHandler for HttpRouterTable {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        self.dispatch(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{matcher::compile_http, parse};
    use hyper::StatusCode;

    struct NamedHandler(&'static str);

    #[async_trait]
    impl HttpHandler for NamedHandler {
        async fn handle(&self, _req: Request<Body>) -> Response<Body> {
            Response::new(Body::from(self.0))
        }
    }

    fn route(name: &str, rule: &str, body: &'static str) -> CompiledHttpRoute {
        let expr = parse(rule).unwrap();
        CompiledHttpRoute {
            name: name.to_string(),
            priority: expr.priority(),
            matcher: compile_http(&expr).unwrap(),
            handler: Arc::new(NamedHandler(body)),
        }
    }

    async fn body_of(resp: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn request(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("http://host{}", path))
            .header("Host", host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_longer_rule_wins() {
        let table = HttpRouterTable::new(vec![
            route("catchall", "PathPrefix(`/`)", "catchall"),
            route("api", "PathPrefix(`/api`) && Host(`example.com`)", "api"),
        ]);

        let resp = table.dispatch(request("example.com", "/api/v1")).await;
        assert_eq!(body_of(resp).await, "api");

        let resp = table.dispatch(request("example.com", "/other")).await;
        assert_eq!(body_of(resp).await, "catchall");
    }

    #[tokio::test]
    async fn test_tie_broken_by_name() {
        let table = HttpRouterTable::new(vec![
            route("b-router", "PathPrefix(`/x`)", "b"),
            route("a-router", "PathPrefix(`/y`)", "a"),
        ]);
        // Equal priorities: dispatch order is lexicographic by name.
        assert_eq!(table.route_names(), vec!["a-router", "b-router"]);
    }

    #[tokio::test]
    async fn test_no_match_is_404() {
        let table = HttpRouterTable::new(vec![route("api", "PathPrefix(`/api`)", "api")]);
        let resp = table.dispatch(request("example.com", "/nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
