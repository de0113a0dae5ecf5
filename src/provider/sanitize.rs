//! Cross-source reference sanitisation.
//!
//! Runs on each incoming message before merge. For the message's declared
//! source, every router, middleware and service is walked and items holding
//! disallowed or dangling references are dropped; the rest of the message
//! survives. Routers whose dependencies were excluded are pruned in the
//! same pass.

use crate::config::dynamic::{
    Configuration, Middleware, Router, Service, TcpRouter, TcpService, UdpRouter, UdpService,
};
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use tracing::error;

/// Determines whether a reference is allowed from the given source.
///
/// A bare name is allowed; `name@source` is allowed; `name@other` is allowed
/// only when `other` does not contain the source name as a substring, so a
/// source may reference foreign names but cannot fabricate names pretending
/// to belong to itself.
pub fn is_allowed_reference(name: &str, source: &str) -> bool {
    let Some((_, ref_source)) = name.split_once('@') else {
        return true;
    };

    if !ref_source.contains(source) {
        return true;
    }

    ref_source == source
}

/// Whether the reference targets a different source than the message's own,
/// in which case existence cannot be checked locally.
fn is_foreign(name: &str, source: &str) -> bool {
    matches!(name.split_once('@'), Some((_, s)) if s != source)
}

fn local_name<'a>(name: &'a str) -> &'a str {
    name.split_once('@').map(|(local, _)| local).unwrap_or(name)
}

/// Removes disallowed cross-source references from a configuration fragment.
pub fn sanitize_references(source: &str, configuration: &Configuration) -> Configuration {
    let mut conf = Configuration::default();

    let http = &configuration.http;
    let mut excluded_middlewares = HashSet::new();
    for (name, middleware) in &http.middlewares {
        let mut visiting = Vec::new();
        if let Err(e) = check_middleware(source, name, &http.middlewares, &mut visiting) {
            excluded_middlewares.insert(name.clone());
            error!(source, "Invalid middleware {:?} configuration: {}", name, e);
            continue;
        }
        conf.http.middlewares.insert(name.clone(), middleware.clone());
    }

    let mut excluded_services = HashSet::new();
    for (name, service) in &http.services {
        let mut visiting = Vec::new();
        if let Err(e) = check_service(source, name, &http.services, &mut visiting) {
            excluded_services.insert(name.clone());
            error!(source, "Invalid service {:?} configuration: {}", name, e);
            continue;
        }
        conf.http.services.insert(name.clone(), service.clone());
    }

    for (name, router) in &http.routers {
        if let Err(e) = check_router(source, router, &excluded_services, &excluded_middlewares) {
            error!(source, "Invalid router {:?} configuration: {}", name, e);
            continue;
        }
        conf.http.routers.insert(name.clone(), router.clone());
    }

    conf.http.models = http.models.clone();
    conf.http.servers_transports = http.servers_transports.clone();

    let tcp = &configuration.tcp;
    let mut excluded_tcp_services = HashSet::new();
    for (name, service) in &tcp.services {
        let mut visiting = Vec::new();
        if let Err(e) = check_tcp_service(source, name, &tcp.services, &mut visiting) {
            excluded_tcp_services.insert(name.clone());
            error!(source, "Invalid TCP service {:?} configuration: {}", name, e);
            continue;
        }
        conf.tcp.services.insert(name.clone(), service.clone());
    }

    for (name, router) in &tcp.routers {
        if let Err(e) = check_tcp_router(source, router, &excluded_tcp_services) {
            error!(source, "Invalid TCP router {:?} configuration: {}", name, e);
            continue;
        }
        conf.tcp.routers.insert(name.clone(), router.clone());
    }

    conf.tcp.middlewares = tcp.middlewares.clone();

    let udp = &configuration.udp;
    let mut excluded_udp_services = HashSet::new();
    for (name, service) in &udp.services {
        let mut visiting = Vec::new();
        if let Err(e) = check_udp_service(source, name, &udp.services, &mut visiting) {
            excluded_udp_services.insert(name.clone());
            error!(source, "Invalid UDP service {:?} configuration: {}", name, e);
            continue;
        }
        conf.udp.services.insert(name.clone(), service.clone());
    }

    for (name, router) in &udp.routers {
        if let Err(e) = check_udp_router(source, router, &excluded_udp_services) {
            error!(source, "Invalid UDP router {:?} configuration: {}", name, e);
            continue;
        }
        conf.udp.routers.insert(name.clone(), router.clone());
    }

    conf.tls = configuration.tls.clone();

    conf
}

/// Checks that all resources referenced by the given router are allowed.
fn check_router(
    source: &str,
    router: &Router,
    excluded_services: &HashSet<String>,
    excluded_middlewares: &HashSet<String>,
) -> Result<()> {
    if excluded_services.contains(&router.service)
        || !is_allowed_reference(&router.service, source)
    {
        return Err(Error::reference("service reference not allowed", &router.service));
    }

    if let Some(tls) = &router.tls {
        if !is_allowed_reference(&tls.options, source) {
            return Err(Error::reference("TLS options reference not allowed", &tls.options));
        }
    }

    for middleware in &router.middlewares {
        if excluded_middlewares.contains(middleware) || !is_allowed_reference(middleware, source) {
            return Err(Error::reference("middleware reference not allowed", middleware));
        }
    }

    Ok(())
}

fn check_tcp_router(
    source: &str,
    router: &TcpRouter,
    excluded_services: &HashSet<String>,
) -> Result<()> {
    if excluded_services.contains(&router.service)
        || !is_allowed_reference(&router.service, source)
    {
        return Err(Error::reference("service reference not allowed", &router.service));
    }

    if let Some(tls) = &router.tls {
        if !is_allowed_reference(&tls.options, source) {
            return Err(Error::reference("TLS options reference not allowed", &tls.options));
        }
    }

    Ok(())
}

fn check_udp_router(
    source: &str,
    router: &UdpRouter,
    excluded_services: &HashSet<String>,
) -> Result<()> {
    if excluded_services.contains(&router.service)
        || !is_allowed_reference(&router.service, source)
    {
        return Err(Error::reference("service reference not allowed", &router.service));
    }

    Ok(())
}

/// Checks that all resources referenced by the given middleware are allowed.
/// Chains are walked recursively; revisiting a name fails the whole chain.
fn check_middleware(
    source: &str,
    name: &str,
    middlewares: &HashMap<String, Middleware>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if !is_allowed_reference(name, source) {
        return Err(Error::reference("middleware reference not allowed", name));
    }

    // References into other sources cannot be resolved locally.
    if is_foreign(name, source) {
        return Ok(());
    }

    if visiting.iter().any(|n| n == name) {
        return Err(Error::reference("middleware chain cycle detected", name));
    }

    let Some(middleware) = middlewares.get(local_name(name)) else {
        return Err(Error::reference("middleware not found", name));
    };

    match middleware {
        Middleware::Chain(chain) => {
            visiting.push(name.to_string());
            for member in &chain.middlewares {
                check_middleware(source, member, middlewares, visiting)
                    .map_err(|e| Error::reference(format!("chain middleware: {}", e), name))?;
            }
            visiting.pop();
        }
        Middleware::Errors(errors) => {
            if !is_allowed_reference(&errors.service, source) {
                return Err(Error::reference(
                    "errors middleware service reference not allowed",
                    &errors.service,
                ));
            }
        }
        Middleware::RequestMirror(mirror) => {
            if !is_allowed_reference(&mirror.service, source) {
                return Err(Error::reference(
                    "mirror middleware service reference not allowed",
                    &mirror.service,
                ));
            }
        }
        _ => {}
    }

    Ok(())
}

/// Checks that all resources referenced by the given service are allowed.
/// Composite services are walked recursively; revisiting a name fails it.
fn check_service(
    source: &str,
    name: &str,
    services: &HashMap<String, Service>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if !is_allowed_reference(name, source) {
        return Err(Error::reference("service reference not allowed", name));
    }

    // Allowing references from other sources (e.g. file). This is mandatory
    // because the service will not exist in the local map of services.
    if is_foreign(name, source) {
        return Ok(());
    }

    if visiting.iter().any(|n| n == name) {
        return Err(Error::reference("service reference cycle detected", name));
    }

    let Some(service) = services.get(local_name(name)) else {
        return Err(Error::reference("service not found", name));
    };

    visiting.push(name.to_string());
    let result = (|| {
        match service {
            Service::LoadBalancer(lb) => {
                if !is_allowed_reference(&lb.servers_transport, source) {
                    return Err(Error::reference(
                        "serversTransport reference not allowed",
                        &lb.servers_transport,
                    ));
                }
            }
            Service::Failover(failover) => {
                check_service(source, &failover.service, services, visiting)?;
                check_service(source, &failover.fallback, services, visiting)?;
            }
            Service::Weighted(wrr) => {
                for child in &wrr.services {
                    check_service(source, &child.name, services, visiting)?;
                }
            }
            Service::Mirroring(mirroring) => {
                check_service(source, &mirroring.service, services, visiting)?;
                for mirror in &mirroring.mirrors {
                    check_service(source, &mirror.name, services, visiting)?;
                }
            }
        }
        Ok(())
    })();
    visiting.pop();

    result
}

fn check_tcp_service(
    source: &str,
    name: &str,
    services: &HashMap<String, TcpService>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if !is_allowed_reference(name, source) {
        return Err(Error::reference("service reference not allowed", name));
    }

    if is_foreign(name, source) {
        return Ok(());
    }

    if visiting.iter().any(|n| n == name) {
        return Err(Error::reference("service reference cycle detected", name));
    }

    let Some(service) = services.get(local_name(name)) else {
        return Err(Error::reference("service not found", name));
    };

    if let TcpService::Weighted(wrr) = service {
        visiting.push(name.to_string());
        for child in &wrr.services {
            let result = check_tcp_service(source, &child.name, services, visiting);
            if result.is_err() {
                visiting.pop();
                return result;
            }
        }
        visiting.pop();
    }

    Ok(())
}

fn check_udp_service(
    source: &str,
    name: &str,
    services: &HashMap<String, UdpService>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if !is_allowed_reference(name, source) {
        return Err(Error::reference("service reference not allowed", name));
    }

    if is_foreign(name, source) {
        return Ok(());
    }

    if visiting.iter().any(|n| n == name) {
        return Err(Error::reference("service reference cycle detected", name));
    }

    let Some(service) = services.get(local_name(name)) else {
        return Err(Error::reference("service not found", name));
    };

    if let UdpService::Weighted(wrr) = service {
        visiting.push(name.to_string());
        for child in &wrr.services {
            let result = check_udp_service(source, &child.name, services, visiting);
            if result.is_err() {
                visiting.pop();
                return result;
            }
        }
        visiting.pop();
    }

    Ok(())
}
