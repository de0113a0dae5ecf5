//! Upstream HTTP/1.1 connection pool.
//!
//! Idle connections live in a bounded channel. A pooled entry records when
//! it went idle; acquiring skips and closes expired or broken entries and
//! dials a new connection when the pool runs dry. Releasing into a full
//! pool closes the connection. A janitor sweeps expired and broken entries
//! at half the idle timeout.
//!
//! Server-initiated close is detected asynchronously: each connection is
//! driven by its own task, and the handle's `is_closed` flips as soon as
//! that task observes EOF from the upstream.

use crate::error::{Error, NetworkErrorKind, Result};
use hyper::client::conn::{self, SendRequest};
use hyper::Body;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::debug;

/// Executor handing hyper's background futures to the tokio runtime.
#[derive(Clone, Copy)]
struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}

/// An idle upstream connection.
#[derive(Debug)]
pub struct PooledConn {
    sender: SendRequest<Body>,
    idle_at: Instant,
    idle_timeout: Duration,
}

impl PooledConn {
    fn is_expired(&self) -> bool {
        !self.idle_timeout.is_zero() && self.idle_at.elapsed() > self.idle_timeout
    }

    fn is_broken(&mut self) -> bool {
        let waker = std::task::Waker::noop();
        let mut cx = std::task::Context::from_waker(waker);
        matches!(self.sender.poll_ready(&mut cx), std::task::Poll::Ready(Err(_)))
    }

    fn is_ready(&mut self) -> bool {
        let waker = std::task::Waker::noop();
        let mut cx = std::task::Context::from_waker(waker);
        matches!(self.sender.poll_ready(&mut cx), std::task::Poll::Ready(Ok(())))
    }

    /// Send a request over this connection.
    pub async fn send_request(
        &mut self,
        req: hyper::Request<Body>,
    ) -> hyper::Result<hyper::Response<Body>> {
        self.sender.send_request(req).await
    }
}

/// A connection pool towards one upstream authority.
pub struct ConnPool {
    authority: String,
    h2c: bool,
    idle_tx: mpsc::Sender<PooledConn>,
    idle_rx: Mutex<mpsc::Receiver<PooledConn>>,
    idle_timeout: Duration,
}

impl ConnPool {
    pub fn new(authority: String, h2c: bool, max_idle_conns: usize, idle_timeout: Duration) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::channel(max_idle_conns.max(1));

        let pool = Arc::new(Self {
            authority,
            h2c,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            idle_timeout,
        });

        if !idle_timeout.is_zero() {
            // The janitor keeps only a weak handle and exits once the pool
            // is gone.
            let weak = Arc::downgrade(&pool);
            let mut ticker = interval(idle_timeout / 2);
            tokio::spawn(async move {
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(pool) => pool.clean_idle_conns(),
                        None => return,
                    }
                }
            });
        }

        pool
    }

    /// Returns a usable connection, dialing when the pool is empty.
    pub async fn acquire(&self) -> Result<PooledConn> {
        // Connections still draining a previous response are healthy but
        // not ready; they go back into the pool untouched.
        let mut busy = Vec::new();

        let result = loop {
            let conn = self.idle_rx.lock().try_recv().ok();
            match conn {
                Some(mut conn) => {
                    if conn.is_expired() || conn.is_broken() {
                        // Dropping lets the drive task finish the close.
                        debug!(authority = self.authority.as_str(), "Discarding stale pooled connection");
                        continue;
                    }
                    if !conn.is_ready() {
                        busy.push(conn);
                        continue;
                    }
                    break Ok(conn);
                }
                None => break self.dial().await,
            }
        };

        for conn in busy {
            let _ = self.idle_tx.try_send(conn);
        }

        result
    }

    /// Return a connection to the pool; a full pool closes it instead.
    pub fn release(&self, mut conn: PooledConn) {
        conn.idle_at = Instant::now();
        if self.idle_tx.try_send(conn).is_err() {
            debug!(authority = self.authority.as_str(), "Idle pool full, closing connection");
        }
    }

    /// Sweep expired and broken entries.
    fn clean_idle_conns(&self) {
        let mut keep = Vec::new();
        {
            let mut rx = self.idle_rx.lock();
            while let Ok(mut conn) = rx.try_recv() {
                if !conn.is_expired() && !conn.is_broken() {
                    keep.push(conn);
                } else {
                    debug!(authority = self.authority.as_str(), "Janitor closing stale connection");
                }
            }
        }
        for conn in keep {
            if self.idle_tx.try_send(conn).is_err() {
                break;
            }
        }
    }

    async fn dial(&self) -> Result<PooledConn> {
        let stream = TcpStream::connect(&self.authority).await.map_err(|e| {
            Error::network(
                format!("dialing upstream '{}': {}", self.authority, e),
                NetworkErrorKind::ConnectionFailed,
            )
        })?;
        let _ = stream.set_nodelay(true);

        let mut builder = conn::Builder::new();
        if self.h2c {
            builder.http2_only(true);
            builder.executor(TokioExecutor);
        }

        let (sender, connection) = builder.handshake::<_, Body>(stream).await?;

        let authority = self.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(authority = authority.as_str(), "Upstream connection terminated: {}", e);
            }
        });

        Ok(PooledConn {
            sender,
            idle_at: Instant::now(),
            idle_timeout: self.idle_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    async fn spawn_upstream() -> SocketAddr {
        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(|_req| async {
                Ok::<_, Infallible>(Response::new(Body::from("hello")))
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn test_acquire_release_reuse() {
        let addr = spawn_upstream().await;
        let pool = ConnPool::new(addr.to_string(), false, 4, Duration::from_secs(30));

        let mut conn = pool.acquire().await.unwrap();
        let req = hyper::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let resp = conn.send_request(req).await.unwrap();
        assert_eq!(resp.status(), 200);
        let _ = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        pool.release(conn);

        // The released connection is usable again.
        let mut conn = pool.acquire().await.unwrap();
        let req = hyper::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let resp = conn.send_request(req).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces_as_network_error() {
        // Port 1 on localhost is never listening.
        let pool = ConnPool::new("127.0.0.1:1".to_string(), false, 1, Duration::from_secs(5));
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }

    #[tokio::test]
    async fn test_expired_connections_are_not_reused() {
        let addr = spawn_upstream().await;
        let pool = ConnPool::new(addr.to_string(), false, 4, Duration::from_millis(50));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Acquire discards the stale entry and dials a fresh one.
        let mut conn = pool.acquire().await.unwrap();
        let req = hyper::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let resp = conn.send_request(req).await.unwrap();
        assert_eq!(resp.status(), 200);
    }
}
