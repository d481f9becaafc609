//! Connection-limiting TCP listener.
//!
//! Wraps a [`TcpListener`] so accepts block once the number of open
//! connections reaches the cap. Each accepted stream holds a semaphore
//! permit released on drop; the cap can be raised or lowered at runtime
//! without restarting the listener.

use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A [`TcpListener`] that refuses new accepts at the connection cap.
pub struct LimitListener {
    listener: TcpListener,
    permits: Arc<Semaphore>,
    configured_max: Mutex<u32>,
}

impl LimitListener {
    /// Wrap `listener` with a cap of `max_connections`.
    pub fn new(listener: TcpListener, max_connections: u32) -> Self {
        Self {
            listener,
            permits: Arc::new(Semaphore::new(max_connections as usize)),
            configured_max: Mutex::new(max_connections),
        }
    }

    /// Accept the next connection, waiting for a free slot first.
    pub async fn accept(&self) -> io::Result<(LimitedStream, SocketAddr)> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "listener closed"))?;
        let (stream, addr) = self.listener.accept().await?;
        Ok((
            LimitedStream {
                stream,
                _permit: permit,
            },
            addr,
        ))
    }

    /// Adjust the connection cap without restarting.
    ///
    /// Raising the cap frees slots immediately; lowering it retires slots as
    /// connections close, never tearing down established ones.
    pub fn set_max_connections(&self, max_connections: u32) {
        let mut configured = self.configured_max.lock();
        let current = *configured;
        if max_connections > current {
            self.permits
                .add_permits((max_connections - current) as usize);
        } else {
            for _ in 0..(current - max_connections) {
                let permits = Arc::clone(&self.permits);
                tokio::spawn(async move {
                    if let Ok(permit) = permits.acquire_owned().await {
                        permit.forget();
                    }
                });
            }
        }
        *configured = max_connections;
    }

    /// Local address of the wrapped listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// A connection counted against its listener's cap.
pub struct LimitedStream {
    stream: TcpStream,
    _permit: OwnedSemaphorePermit,
}

impl AsyncRead for LimitedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LimitedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn bound_listener(max: u32) -> (LimitListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (LimitListener::new(listener, max), addr)
    }

    #[tokio::test]
    async fn accepts_block_at_the_cap() {
        let (listener, addr) = bound_listener(1).await;

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let (held, _) = listener.accept().await.unwrap();

        // A second accept cannot proceed while the first stream is alive.
        let _c2 = TcpStream::connect(addr).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(blocked.is_err(), "accept should block at the cap");

        drop(held);
        let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        assert!(accepted.is_ok_and(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn raising_the_cap_unblocks_accepts() {
        let (listener, addr) = bound_listener(1).await;

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _held = listener.accept().await.unwrap();

        let _c2 = TcpStream::connect(addr).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(blocked.is_err());

        listener.set_max_connections(2);
        let accepted = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        assert!(accepted.is_ok_and(|r| r.is_ok()));
    }
}
