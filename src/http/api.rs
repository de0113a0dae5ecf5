//! Built-in API service (`api@internal`).
//!
//! Read-only introspection of the live snapshot under `/api`.

use super::HttpHandler;
use crate::server::watcher::Snapshot;
use async_trait::async_trait;
use hyper::{Body, Request, Response, StatusCode};
use std::sync::Arc;

pub struct ApiHandler {
    snapshot: Arc<Snapshot>,
}

impl ApiHandler {
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self { snapshot }
    }

    fn json(value: serde_json::Value) -> Response<Body> {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl HttpHandler for ApiHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let configuration = &self.snapshot.configuration;

        match req.uri().path() {
            "/api/rawdata" => Self::json(serde_json::json!({
                "generation": self.snapshot.generation,
                "configuration": configuration,
            })),
            "/api/overview" => Self::json(serde_json::json!({
                "http": {
                    "routers": configuration.http.routers.len(),
                    "services": configuration.http.services.len(),
                    "middlewares": configuration.http.middlewares.len(),
                },
                "tcp": {
                    "routers": configuration.tcp.routers.len(),
                    "services": configuration.tcp.services.len(),
                },
                "udp": {
                    "routers": configuration.udp.routers.len(),
                    "services": configuration.udp.services.len(),
                },
            })),
            "/api/http/routers" => Self::json(serde_json::json!(configuration.http.routers)),
            "/api/http/services" => Self::json(serde_json::json!(configuration.http.services)),
            "/api/http/middlewares" => {
                Self::json(serde_json::json!(configuration.http.middlewares))
            }
            "/api/tcp/routers" => Self::json(serde_json::json!(configuration.tcp.routers)),
            "/api/udp/routers" => Self::json(serde_json::json!(configuration.udp.routers)),
            path if path.starts_with("/api") => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Not Found"))
                .unwrap_or_default(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Not Found"))
                .unwrap_or_default(),
        }
    }
}
