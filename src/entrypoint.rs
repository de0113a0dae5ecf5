//! Entry points: listening sockets with hot-swappable handler tables.
//!
//! Each entry point owns its socket and an atomically swapped pointer to
//! the current compiled handlers. Accepted connections keep the table they
//! started with, so a swap never tears an in-flight connection; replaced
//! tables drop once their last connection finishes.

use crate::config::{EntryPointConfig, EntryPointProtocol};
use crate::error::Result;
use crate::provider::ShutdownSignal;
use crate::tcp::router::TcpRouterTable;
use crate::udp::router::UdpRouterTable;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info};

pub struct EntryPoint {
    pub name: String,
    pub address: String,
    pub protocol: EntryPointProtocol,
    tcp_handler: ArcSwapOption<TcpRouterTable>,
    udp_handler: ArcSwapOption<UdpRouterTable>,
}

impl EntryPoint {
    pub fn new(name: String, config: &EntryPointConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            address: config.address.clone(),
            protocol: config.protocol,
            tcp_handler: ArcSwapOption::empty(),
            udp_handler: ArcSwapOption::empty(),
        })
    }

    /// Install the handlers of a fresh snapshot. The previous table keeps
    /// serving its in-flight connections until they finish.
    pub fn swap_tcp(&self, table: Arc<TcpRouterTable>) {
        self.tcp_handler.store(Some(table));
    }

    pub fn swap_udp(&self, table: Arc<UdpRouterTable>) {
        self.udp_handler.store(Some(table));
    }

    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> Result<()> {
        match self.protocol {
            EntryPointProtocol::Tcp => self.run_tcp(shutdown).await,
            EntryPointProtocol::Udp => self.run_udp(shutdown).await,
        }
    }

    async fn run_tcp(self: Arc<Self>, mut shutdown: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        info!(entry_point = self.name.as_str(), address = self.address.as_str(), "Listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(entry_point = self.name.as_str(), "Shutting down listener");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let Some(table) = self.tcp_handler.load_full() else {
                                debug!(entry_point = self.name.as_str(), "No handlers yet, dropping connection");
                                continue;
                            };
                            tokio::spawn(table.serve(stream, peer));
                        }
                        Err(e) => {
                            error!(entry_point = self.name.as_str(), "Accept failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn run_udp(self: Arc<Self>, mut shutdown: ShutdownSignal) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(&self.address).await?);
        info!(entry_point = self.name.as_str(), address = self.address.as_str(), "Listening (UDP)");

        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(entry_point = self.name.as_str(), "Shutting down UDP socket");
                    return Ok(());
                }
                received = socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((n, peer)) => {
                            let Some(table) = self.udp_handler.load_full() else { continue };
                            if !table.has_route() {
                                continue;
                            }
                            table.handle_packet(socket.clone(), peer, &buffer[..n]).await;
                        }
                        Err(e) => {
                            error!(entry_point = self.name.as_str(), "UDP receive failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}
