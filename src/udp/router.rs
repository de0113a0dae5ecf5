//! UDP packet dispatch keyed by source address.
//!
//! Each client address gets a session owning a socket towards the selected
//! backend; replies are relayed back through the entry point's socket.
//! Sessions expire after an idle period.

use crate::config::dynamic::UdpService;
use crate::error::{Error, Result};
use ahash::RandomState;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const REPLY_BUFFER_SIZE: usize = 64 * 1024;

pub struct CompiledUdpRoute {
    pub name: String,
    pub addresses: Vec<String>,
}

/// Flatten a UDP service into backend addresses, weighted children
/// included.
pub fn flatten_udp_service(
    name: &str,
    services: &HashMap<String, UdpService>,
) -> Result<Vec<String>> {
    fn walk(
        name: &str,
        services: &HashMap<String, UdpService>,
        out: &mut Vec<String>,
        visiting: &mut Vec<String>,
    ) -> Result<()> {
        if visiting.iter().any(|n| n == name) {
            return Err(Error::reference("UDP service cycle", name));
        }
        let service = services
            .get(name)
            .ok_or_else(|| Error::reference("UDP service not found", name))?;

        match service {
            UdpService::LoadBalancer(lb) => {
                for server in &lb.servers {
                    out.push(server.address.clone());
                }
            }
            UdpService::Weighted(wrr) => {
                visiting.push(name.to_string());
                for child in &wrr.services {
                    let weight = child.weight.unwrap_or(1) as usize;
                    for _ in 0..weight {
                        walk(&child.name, services, out, visiting)?;
                    }
                }
                visiting.pop();
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    let mut visiting = Vec::new();
    walk(name, services, &mut out, &mut visiting)?;
    Ok(out)
}

struct UdpSession {
    upstream: Arc<UdpSocket>,
    last_activity: parking_lot::Mutex<Instant>,
}

impl UdpSession {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn is_expired(&self) -> bool {
        self.last_activity.lock().elapsed() > SESSION_TIMEOUT
    }
}

/// Routing table for one UDP entry point. The first router by name owns the
/// entry point; UDP rules carry no matching content.
pub struct UdpRouterTable {
    route: Option<CompiledUdpRoute>,
    counter: AtomicUsize,
    sessions: DashMap<SocketAddr, Arc<UdpSession>, RandomState>,
}

impl UdpRouterTable {
    pub fn new(mut routes: Vec<CompiledUdpRoute>) -> Arc<Self> {
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        if routes.len() > 1 {
            warn!(
                "Multiple UDP routers share one entry point; using {:?}",
                routes[0].name
            );
        }
        Arc::new(Self {
            route: routes.into_iter().next(),
            counter: AtomicUsize::new(0),
            sessions: DashMap::with_hasher(RandomState::new()),
        })
    }

    pub fn has_route(&self) -> bool {
        self.route.is_some()
    }

    fn select_address(&self) -> Option<&str> {
        let route = self.route.as_ref()?;
        if route.addresses.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % route.addresses.len();
        Some(&route.addresses[idx])
    }

    /// Forward one datagram, creating the session on first contact.
    pub async fn handle_packet(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        client: SocketAddr,
        data: &[u8],
    ) {
        let session = match Self::get_or_create_session(&self, socket, client).await {
            Ok(session) => session,
            Err(e) => {
                debug!(client = %client, "Dropping datagram: {}", e);
                return;
            }
        };

        session.touch();
        if let Err(e) = session.upstream.send(data).await {
            debug!(client = %client, "Failed to forward datagram: {}", e);
            self.sessions.remove(&client);
        }
    }

    async fn get_or_create_session(
        this: &Arc<Self>,
        socket: Arc<UdpSocket>,
        client: SocketAddr,
    ) -> Result<Arc<UdpSession>> {
        if let Some(session) = this.sessions.get(&client) {
            if !session.is_expired() {
                return Ok(session.clone());
            }
            drop(session);
            this.sessions.remove(&client);
        }

        let address = this
            .select_address()
            .ok_or_else(|| Error::reference("no UDP backend available", "udp"))?
            .to_string();

        let upstream = UdpSocket::bind("0.0.0.0:0").await?;
        upstream.connect(&address).await?;
        let upstream = Arc::new(upstream);

        let session = Arc::new(UdpSession {
            upstream: upstream.clone(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        });
        this.sessions.insert(client, session.clone());
        debug!(client = %client, backend = address.as_str(), "Created UDP session");

        // Reply relay: runs until the session idles out.
        let table = this.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; REPLY_BUFFER_SIZE];
            loop {
                match timeout(SESSION_TIMEOUT, upstream.recv(&mut buffer)).await {
                    Ok(Ok(n)) => {
                        if socket.send_to(&buffer[..n], client).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            table.sessions.remove(&client);
            debug!(client = %client, "UDP session closed");
        });

        Ok(session)
    }
}
