//! TCP routing and proxying.

pub mod clienthello;
pub mod router;

use crate::config::dynamic::TcpService;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// A stream that replays already-peeked bytes before the inner stream.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Round-robin address selection for a TCP service tree.
pub struct TcpServiceHandler {
    name: String,
    addresses: Vec<String>,
    counter: AtomicUsize,
}

impl TcpServiceHandler {
    /// Flatten a TCP service into its backend addresses, following
    /// weighted children with cycle protection.
    pub fn build(
        name: &str,
        services: &HashMap<String, TcpService>,
    ) -> Result<Arc<TcpServiceHandler>> {
        let mut addresses = Vec::new();
        let mut visiting = Vec::new();
        collect_addresses(name, services, &mut addresses, &mut visiting)?;

        Ok(Arc::new(TcpServiceHandler {
            name: name.to_string(),
            addresses,
            counter: AtomicUsize::new(0),
        }))
    }

    pub fn select(&self) -> Option<&str> {
        if self.addresses.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        Some(&self.addresses[idx])
    }

    /// Open a connection to the next backend and shuttle bytes both ways
    /// until either side closes.
    pub async fn proxy<S>(&self, mut client: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(address) = self.select() else {
            return Err(Error::reference("TCP service has no servers", &self.name));
        };

        let mut upstream = TcpStream::connect(address).await?;
        let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        debug!(
            service = self.name.as_str(),
            address, sent, received, "TCP connection closed"
        );
        Ok(())
    }
}

fn collect_addresses(
    name: &str,
    services: &HashMap<String, TcpService>,
    addresses: &mut Vec<String>,
    visiting: &mut Vec<String>,
) -> Result<()> {
    if visiting.iter().any(|n| n == name) {
        return Err(Error::reference("TCP service cycle", name));
    }

    let service = services
        .get(name)
        .ok_or_else(|| Error::reference("TCP service not found", name))?;

    match service {
        TcpService::LoadBalancer(lb) => {
            for server in &lb.servers {
                addresses.push(server.address.clone());
            }
        }
        TcpService::Weighted(wrr) => {
            visiting.push(name.to_string());
            for child in &wrr.services {
                let weight = child.weight.unwrap_or(1) as usize;
                for _ in 0..weight {
                    collect_addresses(&child.name, services, addresses, visiting)?;
                }
            }
            visiting.pop();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::{TcpServer, TcpServersLoadBalancer, TcpWeightedRoundRobin, WrrService};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefixed_stream_replays_prefix() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut prefixed = PrefixedStream::new(b"HELLO ".to_vec(), client);

        server.write_all(b"WORLD").await.unwrap();
        drop(server);

        let mut out = Vec::new();
        prefixed.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HELLO WORLD");
    }

    #[test]
    fn test_weighted_flattening() {
        let mut services = HashMap::new();
        services.insert(
            "a".to_string(),
            TcpService::LoadBalancer(TcpServersLoadBalancer {
                servers: vec![TcpServer {
                    address: "10.0.0.1:5432".to_string(),
                }],
            }),
        );
        services.insert(
            "b".to_string(),
            TcpService::LoadBalancer(TcpServersLoadBalancer {
                servers: vec![TcpServer {
                    address: "10.0.0.2:5432".to_string(),
                }],
            }),
        );
        services.insert(
            "w".to_string(),
            TcpService::Weighted(TcpWeightedRoundRobin {
                services: vec![
                    WrrService {
                        name: "a".to_string(),
                        weight: Some(2),
                        status: None,
                    },
                    WrrService {
                        name: "b".to_string(),
                        weight: Some(1),
                        status: None,
                    },
                ],
            }),
        );

        let handler = TcpServiceHandler::build("w", &services).unwrap();
        assert_eq!(handler.addresses.len(), 3);
        assert_eq!(
            handler
                .addresses
                .iter()
                .filter(|a| a.as_str() == "10.0.0.1:5432")
                .count(),
            2
        );
    }

    #[test]
    fn test_cycle_detection() {
        let mut services = HashMap::new();
        services.insert(
            "w".to_string(),
            TcpService::Weighted(TcpWeightedRoundRobin {
                services: vec![WrrService {
                    name: "w".to_string(),
                    weight: Some(1),
                    status: None,
                }],
            }),
        );
        assert!(TcpServiceHandler::build("w", &services).is_err());
    }

    #[test]
    fn test_empty_service_selects_nothing() {
        let mut services = HashMap::new();
        services.insert(
            "empty".to_string(),
            TcpService::LoadBalancer(TcpServersLoadBalancer::default()),
        );
        let handler = TcpServiceHandler::build("empty", &services).unwrap();
        assert!(handler.select().is_none());
    }
}
