//! HTTP handler abstraction.
//!
//! Handlers are immutable once built; a request is served entirely by the
//! handler tree of the snapshot it started on, so a hot swap never tears an
//! in-flight request.

pub mod api;
pub mod router;

use async_trait::async_trait;
use hyper::{Body, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;

/// Connection data attached to every request by the entry point.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub peer: SocketAddr,
}

/// An asynchronous HTTP request handler.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, req: Request<Body>) -> Response<Body>;
}

pub type SharedHandler = Arc<dyn HttpHandler>;

impl std::fmt::Debug for dyn HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn HttpHandler")
    }
}

/// Terminal handler answering a fixed status code.
pub struct StatusHandler {
    status: StatusCode,
}

impl StatusHandler {
    pub fn new(status: StatusCode) -> SharedHandler {
        Arc::new(Self { status })
    }

    /// The terminal used for unknown or cyclic references.
    pub fn service_unavailable() -> SharedHandler {
        Self::new(StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn not_found() -> SharedHandler {
        Self::new(StatusCode::NOT_FOUND)
    }
}

#[async_trait]
impl HttpHandler for StatusHandler {
    async fn handle(&self, _req: Request<Body>) -> Response<Body> {
        let message = self
            .status
            .canonical_reason()
            .unwrap_or("Unknown Status");
        Response::builder()
            .status(self.status)
            .header("Content-Type", "text/plain")
            .body(Body::from(message))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_handler() {
        let handler = StatusHandler::service_unavailable();
        let resp = handler
            .handle(Request::new(Body::empty()))
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
