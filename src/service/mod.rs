//! Building request handlers out of the service section of a snapshot.
//!
//! Services form a tree: Weighted, Mirroring and Failover nodes compose
//! other services by qualified name and every leaf is a LoadBalancer.
//! Building walks that tree with cycle detection; the factory turns a
//! failed build into the 503 terminal for the affected router only.

pub mod healthcheck;
pub mod loadbalancer;

use crate::config::dynamic::{Mirroring, Service, WeightedRoundRobin};
use crate::error::{Error, Result};
use crate::http::{HttpHandler, SharedHandler, StatusHandler};
use crate::proxy::ReverseProxy;
use async_trait::async_trait;
use hyper::{Body, Request, Response, StatusCode};
use loadbalancer::LoadBalancerHandler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ServiceManager {
    services: HashMap<String, Service>,
    proxy: Arc<ReverseProxy>,
    internals: HashMap<String, SharedHandler>,
    built: HashMap<String, SharedHandler>,
    lb_handlers: HashMap<String, Arc<LoadBalancerHandler>>,
}

impl ServiceManager {
    pub fn new(
        services: HashMap<String, Service>,
        proxy: Arc<ReverseProxy>,
        internals: HashMap<String, SharedHandler>,
    ) -> Self {
        Self {
            services,
            proxy,
            internals,
            built: HashMap::new(),
            lb_handlers: HashMap::new(),
        }
    }

    /// Build (or reuse) the handler for a qualified service name.
    pub fn build(&mut self, name: &str) -> Result<SharedHandler> {
        let mut visiting = Vec::new();
        self.build_inner(name, &mut visiting)
    }

    fn build_inner(&mut self, name: &str, visiting: &mut Vec<String>) -> Result<SharedHandler> {
        if let Some(handler) = self.internals.get(name) {
            return Ok(handler.clone());
        }
        if let Some(handler) = self.built.get(name) {
            return Ok(handler.clone());
        }
        if visiting.iter().any(|n| n == name) {
            return Err(Error::reference("service reference cycle", name));
        }

        let service = self
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| Error::reference("service not found", name))?;

        visiting.push(name.to_string());
        let result = match &service {
            Service::LoadBalancer(lb) => {
                let handler = LoadBalancerHandler::new(name.to_string(), lb, self.proxy.clone());
                if let Some(health) = &lb.health_check {
                    healthcheck::spawn_health_checker(&handler, health);
                }
                self.lb_handlers.insert(name.to_string(), handler.clone());
                Ok(handler as SharedHandler)
            }
            Service::Weighted(wrr) => self.build_weighted(name, wrr, visiting),
            Service::Mirroring(mirroring) => self.build_mirroring(name, mirroring, visiting),
            Service::Failover(failover) => {
                let primary = self.build_inner(&failover.service, visiting)?;
                let fallback = self.build_inner(&failover.fallback, visiting)?;
                let primary_lb = self.lb_handlers.get(&failover.service).cloned();
                Ok(Arc::new(FailoverHandler {
                    name: name.to_string(),
                    primary,
                    fallback,
                    primary_lb,
                }) as SharedHandler)
            }
        };
        visiting.pop();

        let handler = result?;
        self.built.insert(name.to_string(), handler.clone());
        Ok(handler)
    }

    fn build_weighted(
        &mut self,
        name: &str,
        wrr: &WeightedRoundRobin,
        visiting: &mut Vec<String>,
    ) -> Result<SharedHandler> {
        let mut children = Vec::new();
        for child in &wrr.services {
            let weight = child.weight.unwrap_or(1);
            if weight == 0 {
                continue;
            }
            let handler = match child.status {
                // Synthesized terminal (e.g. an unresolved gateway ref).
                Some(status) => StatusHandler::new(
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                ),
                None => self.build_inner(&child.name, visiting)?,
            };
            children.push((handler, weight));
        }

        Ok(Arc::new(WeightedHandler {
            name: name.to_string(),
            children,
            counter: AtomicUsize::new(0),
        }))
    }

    fn build_mirroring(
        &mut self,
        name: &str,
        mirroring: &Mirroring,
        visiting: &mut Vec<String>,
    ) -> Result<SharedHandler> {
        let primary = self.build_inner(&mirroring.service, visiting)?;
        let mut mirrors = Vec::new();
        for mirror in &mirroring.mirrors {
            let handler = self.build_inner(&mirror.name, visiting)?;
            mirrors.push(MirrorTarget {
                handler,
                percent: mirror.percent.min(100),
                sent: AtomicU64::new(0),
            });
        }

        Ok(Arc::new(MirroringHandler {
            name: name.to_string(),
            primary,
            mirrors,
            total: AtomicU64::new(0),
            max_body_size: mirroring.max_body_size,
        }))
    }
}

/// Weighted round-robin over child handlers. Zero children answer 503.
struct WeightedHandler {
    name: String,
    children: Vec<(SharedHandler, u32)>,
    counter: AtomicUsize,
}

#[async_trait]
impl HttpHandler for WeightedHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if self.children.is_empty() {
            debug!(service = self.name.as_str(), "Weighted service has no children");
            return Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(Body::from("Service Unavailable"))
                .unwrap_or_default();
        }

        let total: usize = self.children.iter().map(|(_, w)| *w as usize).sum();
        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for (handler, weight) in &self.children {
            let weight = *weight as usize;
            if slot < weight {
                return handler.handle(req).await;
            }
            slot -= weight;
        }

        unreachable!("slot always lands inside the total weight")
    }
}

struct MirrorTarget {
    handler: SharedHandler,
    percent: u32,
    sent: AtomicU64,
}

/// Dispatches the primary synchronously and replicates fire-and-forget to
/// each mirror with its declared percentage.
struct MirroringHandler {
    name: String,
    primary: SharedHandler,
    mirrors: Vec<MirrorTarget>,
    total: AtomicU64,
    max_body_size: Option<i64>,
}

impl MirroringHandler {
    fn clone_request(template: &Request<Body>, body: &bytes::Bytes) -> Request<Body> {
        let mut builder = Request::builder()
            .method(template.method())
            .uri(template.uri());
        if let Some(headers) = builder.headers_mut() {
            *headers = template.headers().clone();
        }
        let mut req = builder
            .body(Body::from(body.clone()))
            .unwrap_or_else(|_| Request::new(Body::empty()));
        if let Some(conn) = template.extensions().get::<crate::http::ConnInfo>() {
            req.extensions_mut().insert(*conn);
        }
        req
    }
}

#[async_trait]
impl HttpHandler for MirroringHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let (parts, body) = req.into_parts();
        let body_bytes = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(service = self.name.as_str(), "Failed to read request body: {}", e);
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("Internal Server Error"))
                    .unwrap_or_default();
            }
        };

        let over_limit = self
            .max_body_size
            .map(|max| max >= 0 && body_bytes.len() as i64 > max)
            .unwrap_or(false);

        let template = Request::from_parts(parts, Body::empty());
        let primary_req = Self::clone_request(&template, &body_bytes);

        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let response = self.primary.handle(primary_req).await;

        if !over_limit {
            for mirror in &self.mirrors {
                let sent = mirror.sent.load(Ordering::Relaxed);
                if sent * 100 >= u64::from(mirror.percent) * total {
                    continue;
                }
                mirror.sent.fetch_add(1, Ordering::Relaxed);

                let mirror_req = Self::clone_request(&template, &body_bytes);
                let handler = mirror.handler.clone();
                tokio::spawn(async move {
                    let _ = handler.handle(mirror_req).await;
                });
            }
        }

        response
    }
}

/// Invokes the fallback while the primary's health check is failing.
struct FailoverHandler {
    name: String,
    primary: SharedHandler,
    fallback: SharedHandler,
    primary_lb: Option<Arc<LoadBalancerHandler>>,
}

#[async_trait]
impl HttpHandler for FailoverHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let primary_healthy = self
            .primary_lb
            .as_ref()
            .map(|lb| lb.has_healthy_server())
            .unwrap_or(true);

        if primary_healthy {
            self.primary.handle(req).await
        } else {
            debug!(service = self.name.as_str(), "Primary unhealthy, using fallback");
            self.fallback.handle(req).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{
        Failover, MirrorService, Server, ServersLoadBalancer, WrrService,
    };

    fn manager(services: Vec<(&str, Service)>) -> ServiceManager {
        ServiceManager::new(
            services
                .into_iter()
                .map(|(name, s)| (name.to_string(), s))
                .collect(),
            Arc::new(ReverseProxy::new()),
            HashMap::new(),
        )
    }

    fn lb(urls: &[&str]) -> Service {
        Service::LoadBalancer(ServersLoadBalancer {
            servers: urls
                .iter()
                .map(|u| Server {
                    url: u.to_string(),
                })
                .collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_unknown_service_fails() {
        let mut manager = manager(vec![]);
        assert!(manager.build("ghost@file").is_err());
    }

    #[test]
    fn test_cycle_fails() {
        let mut manager = manager(vec![(
            "w@file",
            Service::Weighted(WeightedRoundRobin {
                services: vec![WrrService {
                    name: "w@file".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        )]);
        let err = manager.build("w@file").unwrap_err();
        assert!(err.is_reference());
    }

    #[test]
    fn test_composite_tree_builds() {
        let mut manager = manager(vec![
            ("leaf@file", lb(&["http://127.0.0.1:8080"])),
            ("fallback@file", lb(&["http://127.0.0.1:8081"])),
            (
                "failover@file",
                Service::Failover(Failover {
                    service: "leaf@file".to_string(),
                    fallback: "fallback@file".to_string(),
                }),
            ),
            (
                "mirrored@file",
                Service::Mirroring(Mirroring {
                    service: "failover@file".to_string(),
                    mirrors: vec![MirrorService {
                        name: "leaf@file".to_string(),
                        percent: 10,
                    }],
                    max_body_size: None,
                }),
            ),
        ]);

        assert!(manager.build("mirrored@file").is_ok());
        // Built handlers are memoized.
        assert!(manager.built.contains_key("failover@file"));
    }

    #[tokio::test]
    async fn test_weighted_zero_children_returns_503() {
        let mut manager = manager(vec![(
            "w@file",
            Service::Weighted(WeightedRoundRobin::default()),
        )]);
        let handler = manager.build("w@file").unwrap();
        let resp = handler.handle(Request::new(Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_child_answers_fixed_code() {
        let mut manager = manager(vec![(
            "w@file",
            Service::Weighted(WeightedRoundRobin {
                services: vec![WrrService {
                    name: "synthetic".to_string(),
                    weight: Some(1),
                    status: Some(500),
                }],
                ..Default::default()
            }),
        )]);
        let handler = manager.build("w@file").unwrap();
        let resp = handler.handle(Request::new(Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_failover_uses_fallback_when_primary_down() {
        let mut manager = manager(vec![
            ("primary@file", lb(&["http://127.0.0.1:1"])),
            (
                "failover@file",
                Service::Failover(Failover {
                    service: "primary@file".to_string(),
                    fallback: "status@file".to_string(),
                }),
            ),
            (
                "status@file",
                Service::Weighted(WeightedRoundRobin {
                    services: vec![WrrService {
                        name: "synthetic".to_string(),
                        weight: Some(1),
                        status: Some(418),
                    }],
                    ..Default::default()
                }),
            ),
        ]);

        let handler = manager.build("failover@file").unwrap();
        // Flag the primary's only server as failing its health check.
        manager.lb_handlers["primary@file"].servers()[0].set_up(false);

        let resp = handler.handle(Request::new(Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    }
}
