//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::gate::RequestGate;
use super::routes::router;
use crate::error::Result;

/// HTTP server for the rate limited API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The gate every limited route goes through
    gate: Arc<RequestGate>,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, gate: Arc<RequestGate>) -> Self {
        Self { addr, gate }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %listener.local_addr()?, "Starting HTTP server");

        axum::serve(
            listener,
            router(self.gate).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryCounterStore, RateLimiter, StaticThreshold, Threshold, Window};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn gate() -> Arc<RequestGate> {
        let limiter = RateLimiter::new(
            Arc::new(StaticThreshold::new(Threshold::new(1))),
            Arc::new(MemoryCounterStore::new()),
            Window::HOUR,
        );
        Arc::new(RequestGate::new(Arc::new(limiter)))
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_with_peer_address_and_shuts_down() {
        // Reserve a free port, then hand it to the server.
        let addr = {
            let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap()
        };
        let (tx, rx) = oneshot::channel::<()>();
        let server = HttpServer::new(addr, gate());
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            rx.await.ok();
        }));

        // Wait for the listener to come up
        let mut ready = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_ok() {
                ready = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(ready, "server never started listening");

        let first = raw_get(addr, "/ping").await;
        assert!(first.starts_with("HTTP/1.1 200"), "{}", first);
        let second = raw_get(addr, "/ping").await;
        assert!(second.starts_with("HTTP/1.1 429"), "{}", second);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
