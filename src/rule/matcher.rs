//! Compilation of parsed rules into per-protocol matcher trees.
//!
//! HTTP trees match on the request shape (host, path, headers, method,
//! query, client IP); TCP trees on {SNI, ALPN, peer IP}; UDP trees on
//! {peer IP}. Leaf evaluation is synchronous and never blocks.

use super::{Expr, MatcherCall};
use crate::error::{Error, Result};
use hyper::http::HeaderMap;
use regex::Regex;
use std::net::IpAddr;

/// Request shape the HTTP matchers evaluate against, extracted once per
/// request by the HTTP router.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestMeta {
    /// Host header value with any port stripped, lowercased.
    pub host: String,
    pub path: String,
    pub method: String,
    pub headers: HeaderMap,
    /// Decoded query pairs in order of appearance.
    pub query: Vec<(String, String)>,
    pub client_ip: Option<IpAddr>,
}

impl HttpRequestMeta {
    /// Extract matcher-relevant request data from a hyper request.
    pub fn from_request<B>(req: &hyper::Request<B>, client_ip: Option<IpAddr>) -> Self {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host())
            .unwrap_or("")
            .to_string();

        let query = req
            .uri()
            .query()
            .map(parse_query)
            .unwrap_or_default();

        Self {
            host: normalize_host(&host),
            path: req.uri().path().to_string(),
            method: req.method().as_str().to_string(),
            headers: req.headers().clone(),
            query,
            client_ip,
        }
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

fn normalize_host(host: &str) -> String {
    let host = host.rsplit_once(':').map_or(host, |(h, port)| {
        // Only strip when the suffix is a port, not an IPv6 tail.
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Connection shape the TCP and UDP matchers evaluate against.
#[derive(Debug, Clone, Default)]
pub struct ConnMeta {
    /// Server name from the TLS ClientHello, when present.
    pub sni: Option<String>,
    /// ALPN protocols offered by the client.
    pub alpn: Vec<String>,
    pub peer_ip: Option<IpAddr>,
}

/// An IPv4/IPv6 network in CIDR notation; a bare address is a /32 or /128.
#[derive(Debug, Clone)]
pub struct Cidr {
    network: u128,
    mask: u128,
    is_v4: bool,
}

impl Cidr {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr_str, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u32 = prefix
                    .parse()
                    .map_err(|_| Error::config(format!("invalid CIDR prefix in '{}'", s)))?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };

        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| Error::config(format!("invalid IP address in '{}'", s)))?;

        let (bits, max_prefix, is_v4) = match addr {
            IpAddr::V4(v4) => (u128::from(u32::from(v4)), 32, true),
            IpAddr::V6(v6) => (u128::from(v6), 128, false),
        };

        let prefix = prefix.unwrap_or(max_prefix);
        if prefix > max_prefix {
            return Err(Error::config(format!("CIDR prefix too large in '{}'", s)));
        }

        let shift = max_prefix - prefix;
        let mask = if shift >= 128 {
            0
        } else {
            (!0u128).checked_shl(shift).unwrap_or(0)
        };
        // For IPv4 limit the mask to the low 32 bits.
        let mask = if is_v4 { mask & u128::from(u32::MAX) } else { mask };

        Ok(Self {
            network: bits & mask,
            mask,
            is_v4,
        })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let (bits, is_v4) = match ip {
            IpAddr::V4(v4) => (u128::from(u32::from(v4)), true),
            IpAddr::V6(v6) => (u128::from(v6), false),
        };
        if is_v4 != self.is_v4 {
            return false;
        }
        bits & self.mask == self.network
    }
}

/// HTTP leaf matchers.
#[derive(Debug, Clone)]
pub enum HttpMatcher {
    Host(Vec<String>),
    HostRegexp(Regex),
    Path(Vec<String>),
    PathPrefix(Vec<String>),
    PathRegexp(Regex),
    Header(String, String),
    HeaderRegexp(String, Regex),
    Method(Vec<String>),
    Query(String, Option<String>),
    QueryRegexp(String, Regex),
    ClientIp(Vec<Cidr>),
}

impl HttpMatcher {
    fn matches(&self, meta: &HttpRequestMeta) -> bool {
        match self {
            Self::Host(hosts) => hosts.iter().any(|h| *h == meta.host),
            Self::HostRegexp(re) => re.is_match(&meta.host),
            Self::Path(paths) => paths.iter().any(|p| *p == meta.path),
            Self::PathPrefix(prefixes) => prefixes.iter().any(|p| path_has_prefix(&meta.path, p)),
            Self::PathRegexp(re) => re.is_match(&meta.path),
            Self::Header(key, value) => meta
                .headers
                .get_all(key)
                .iter()
                .any(|v| v.to_str().map(|v| v == value).unwrap_or(false)),
            Self::HeaderRegexp(key, re) => meta
                .headers
                .get_all(key)
                .iter()
                .any(|v| v.to_str().map(|v| re.is_match(v)).unwrap_or(false)),
            Self::Method(methods) => methods.iter().any(|m| *m == meta.method),
            Self::Query(key, value) => meta.query.iter().any(|(k, v)| {
                k == key && value.as_ref().map(|want| v == want).unwrap_or(true)
            }),
            Self::QueryRegexp(key, re) => {
                meta.query.iter().any(|(k, v)| k == key && re.is_match(v))
            }
            Self::ClientIp(cidrs) => match meta.client_ip {
                Some(ip) => cidrs.iter().any(|c| c.contains(ip)),
                None => false,
            },
        }
    }
}

/// Segment-aware prefix match: `/foo` matches `/foo` and `/foo/bar`, but
/// not `/foobar`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    if path.len() == prefix.len() || prefix.ends_with('/') {
        return true;
    }
    path.as_bytes().get(prefix.len()) == Some(&b'/')
}

/// TCP leaf matchers.
#[derive(Debug, Clone)]
pub enum TcpMatcher {
    HostSni(Vec<String>),
    HostSniRegexp(Regex),
    Alpn(Vec<String>),
    ClientIp(Vec<Cidr>),
}

impl TcpMatcher {
    fn matches(&self, meta: &ConnMeta) -> bool {
        match self {
            Self::HostSni(hosts) => {
                // `HostSNI(*)` accepts any connection, with or without SNI.
                if hosts.iter().any(|h| h == "*") {
                    return true;
                }
                match &meta.sni {
                    Some(sni) => {
                        let sni = sni.to_ascii_lowercase();
                        hosts.iter().any(|h| *h == sni)
                    }
                    None => false,
                }
            }
            Self::HostSniRegexp(re) => meta
                .sni
                .as_deref()
                .map(|sni| re.is_match(&sni.to_ascii_lowercase()))
                .unwrap_or(false),
            Self::Alpn(protos) => protos.iter().any(|p| meta.alpn.iter().any(|a| a == p)),
            Self::ClientIp(cidrs) => match meta.peer_ip {
                Some(ip) => cidrs.iter().any(|c| c.contains(ip)),
                None => false,
            },
        }
    }
}

/// UDP leaf matchers.
#[derive(Debug, Clone)]
pub enum UdpMatcher {
    ClientIp(Vec<Cidr>),
}

impl UdpMatcher {
    fn matches(&self, meta: &ConnMeta) -> bool {
        match self {
            Self::ClientIp(cidrs) => match meta.peer_ip {
                Some(ip) => cidrs.iter().any(|c| c.contains(ip)),
                None => false,
            },
        }
    }
}

/// A compiled matcher tree generic over the leaf kind.
#[derive(Debug, Clone)]
pub enum MatcherTree<M> {
    Leaf(M),
    And(Box<MatcherTree<M>>, Box<MatcherTree<M>>),
    Or(Box<MatcherTree<M>>, Box<MatcherTree<M>>),
    Not(Box<MatcherTree<M>>),
}

impl<M> MatcherTree<M> {
    fn eval(&self, pred: &impl Fn(&M) -> bool) -> bool {
        match self {
            Self::Leaf(m) => pred(m),
            Self::And(lhs, rhs) => lhs.eval(pred) && rhs.eval(pred),
            Self::Or(lhs, rhs) => lhs.eval(pred) || rhs.eval(pred),
            Self::Not(inner) => !inner.eval(pred),
        }
    }
}

impl MatcherTree<HttpMatcher> {
    pub fn matches(&self, meta: &HttpRequestMeta) -> bool {
        self.eval(&|m| m.matches(meta))
    }
}

impl MatcherTree<TcpMatcher> {
    pub fn matches(&self, meta: &ConnMeta) -> bool {
        self.eval(&|m| m.matches(meta))
    }
}

impl MatcherTree<UdpMatcher> {
    pub fn matches(&self, meta: &ConnMeta) -> bool {
        self.eval(&|m| m.matches(meta))
    }
}

fn one_arg(call: &MatcherCall) -> Result<&str> {
    match call.args.as_slice() {
        [arg] => Ok(arg),
        _ => Err(Error::rule("expected exactly one argument", &call.name)),
    }
}

fn two_args(call: &MatcherCall) -> Result<(&str, &str)> {
    match call.args.as_slice() {
        [a, b] => Ok((a, b)),
        _ => Err(Error::rule("expected exactly two arguments", &call.name)),
    }
}

fn at_least_one_arg(call: &MatcherCall) -> Result<&[String]> {
    if call.args.is_empty() {
        return Err(Error::rule("expected at least one argument", &call.name));
    }
    Ok(&call.args)
}

fn compile_regex(pattern: &str, call: &MatcherCall) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::rule(format!("invalid regexp: {}", e), &call.name))
}

fn compile_http_leaf(call: &MatcherCall) -> Result<HttpMatcher> {
    match call.name.as_str() {
        "Host" => Ok(HttpMatcher::Host(
            at_least_one_arg(call)?
                .iter()
                .map(|h| normalize_host(h))
                .collect(),
        )),
        "HostRegexp" => Ok(HttpMatcher::HostRegexp(compile_regex(one_arg(call)?, call)?)),
        "Path" => Ok(HttpMatcher::Path(at_least_one_arg(call)?.to_vec())),
        "PathPrefix" => Ok(HttpMatcher::PathPrefix(at_least_one_arg(call)?.to_vec())),
        "PathRegexp" => Ok(HttpMatcher::PathRegexp(compile_regex(one_arg(call)?, call)?)),
        "Header" => {
            let (k, v) = two_args(call)?;
            Ok(HttpMatcher::Header(k.to_string(), v.to_string()))
        }
        "HeaderRegexp" => {
            let (k, v) = two_args(call)?;
            Ok(HttpMatcher::HeaderRegexp(k.to_string(), compile_regex(v, call)?))
        }
        "Method" => Ok(HttpMatcher::Method(
            at_least_one_arg(call)?
                .iter()
                .map(|m| m.to_ascii_uppercase())
                .collect(),
        )),
        "Query" => match call.args.as_slice() {
            [k] => Ok(HttpMatcher::Query(k.clone(), None)),
            [k, v] => Ok(HttpMatcher::Query(k.clone(), Some(v.clone()))),
            _ => Err(Error::rule("expected one or two arguments", "Query")),
        },
        "QueryRegexp" => {
            let (k, v) = two_args(call)?;
            Ok(HttpMatcher::QueryRegexp(k.to_string(), compile_regex(v, call)?))
        }
        "ClientIP" => {
            let cidrs = at_least_one_arg(call)?
                .iter()
                .map(|c| Cidr::parse(c))
                .collect::<Result<Vec<_>>>()?;
            Ok(HttpMatcher::ClientIp(cidrs))
        }
        name => Err(Error::rule("unknown HTTP matcher", name)),
    }
}

fn compile_tcp_leaf(call: &MatcherCall) -> Result<TcpMatcher> {
    match call.name.as_str() {
        "HostSNI" => Ok(TcpMatcher::HostSni(
            at_least_one_arg(call)?
                .iter()
                .map(|h| if h == "*" { h.clone() } else { normalize_host(h) })
                .collect(),
        )),
        "HostSNIRegexp" => Ok(TcpMatcher::HostSniRegexp(compile_regex(one_arg(call)?, call)?)),
        "ALPN" => Ok(TcpMatcher::Alpn(at_least_one_arg(call)?.to_vec())),
        "ClientIP" => {
            let cidrs = at_least_one_arg(call)?
                .iter()
                .map(|c| Cidr::parse(c))
                .collect::<Result<Vec<_>>>()?;
            Ok(TcpMatcher::ClientIp(cidrs))
        }
        name => Err(Error::rule("unknown TCP matcher", name)),
    }
}

fn compile_udp_leaf(call: &MatcherCall) -> Result<UdpMatcher> {
    match call.name.as_str() {
        "ClientIP" => {
            let cidrs = at_least_one_arg(call)?
                .iter()
                .map(|c| Cidr::parse(c))
                .collect::<Result<Vec<_>>>()?;
            Ok(UdpMatcher::ClientIp(cidrs))
        }
        name => Err(Error::rule("unknown UDP matcher", name)),
    }
}

fn compile<M>(expr: &Expr, leaf: &impl Fn(&MatcherCall) -> Result<M>) -> Result<MatcherTree<M>> {
    match expr {
        Expr::Call(call) => Ok(MatcherTree::Leaf(leaf(call)?)),
        Expr::And(lhs, rhs) => Ok(MatcherTree::And(
            Box::new(compile(lhs, leaf)?),
            Box::new(compile(rhs, leaf)?),
        )),
        Expr::Or(lhs, rhs) => Ok(MatcherTree::Or(
            Box::new(compile(lhs, leaf)?),
            Box::new(compile(rhs, leaf)?),
        )),
        Expr::Not(inner) => Ok(MatcherTree::Not(Box::new(compile(inner, leaf)?))),
    }
}

/// Compile a parsed rule into an HTTP matcher tree.
pub fn compile_http(expr: &Expr) -> Result<MatcherTree<HttpMatcher>> {
    compile(expr, &compile_http_leaf)
}

/// Compile a parsed rule into a TCP matcher tree.
pub fn compile_tcp(expr: &Expr) -> Result<MatcherTree<TcpMatcher>> {
    compile(expr, &compile_tcp_leaf)
}

/// Compile a parsed rule into a UDP matcher tree.
pub fn compile_udp(expr: &Expr) -> Result<MatcherTree<UdpMatcher>> {
    compile(expr, &compile_udp_leaf)
}
