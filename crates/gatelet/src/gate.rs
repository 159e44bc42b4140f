//! Accept gate: the front door of the connection-admission pool.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::config::ACCEPT_PRIORITY;
use crate::slot::{SlotPool, Token};

/// Wraps a listener so that connections are only accepted while the
/// connection pool has room. Accepted sockets carry their pool token for
/// the lifetime of the connection.
pub struct AcceptGate {
    listener: AsyncFd<std::net::TcpListener>,
    pool: Arc<SlotPool>,
}

impl AcceptGate {
    pub fn new(listener: std::net::TcpListener, pool: Arc<SlotPool>) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener: AsyncFd::new(listener)?,
            pool,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.get_ref().local_addr()
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    /// Accept the next connection once both the listener is readable and a
    /// connection slot is available.
    ///
    /// The slot is acquired only after the listener signals readiness, and
    /// is handed back if the non-blocking accept then loses the connection
    /// to another accept loop. Holding a slot across a failed accept would
    /// wedge the pool under thundering-herd wakeups.
    pub async fn accept(&self) -> io::Result<(BoundSocket, SocketAddr)> {
        loop {
            let mut guard = self.listener.readable().await?;
            let token = self.pool.acquire(ACCEPT_PRIORITY).await;
            match self.listener.get_ref().accept() {
                Ok((stream, peer)) => {
                    // Token drop releases the slot if stream setup fails.
                    stream.set_nonblocking(true)?;
                    let stream = TcpStream::from_std(stream)?;
                    tracing::debug!(%peer, token = token.id(), "connection admitted");
                    return Ok((BoundSocket::new(stream, Arc::new(token)), peer));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // No connection materialised for us.
                    token.release();
                    guard.clear_ready();
                }
                Err(err) => {
                    token.release();
                    return Err(err);
                }
            }
        }
    }
}

/// An accepted socket bound to its connection-pool token.
///
/// The token is released exactly once: on drop, or earlier when a promotion
/// borrows it and hands it back to the accept path (release is idempotent,
/// so the drop is then a no-op). I/O is forwarded to the underlying stream.
pub struct BoundSocket {
    stream: TcpStream,
    token: Arc<Token>,
}

impl BoundSocket {
    pub fn new(stream: TcpStream, token: Arc<Token>) -> Self {
        Self { stream, token }
    }

    pub fn token(&self) -> &Arc<Token> {
        &self.token
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

impl AsyncRead for BoundSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BoundSocket {
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

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        self.token.release();
    }
}
