//! TCP listener and per-connection idle tracking.
//!
//! [`ListenerBinding`] owns the bound socket. Turning it into a stream of
//! connections with [`ListenerBinding::into_incoming`] hands ownership to the
//! transport; the socket is closed when the accept loop ends.
//!
//! Each accepted connection is wrapped in an [`IdleTimeoutStream`]. HTTP/2
//! keepalive pings only detect dead peers; the idle timeout closes healthy
//! connections that have carried no traffic for too long.
//!
//! A connection is only idle while it has no open calls. The stream shares a
//! per-connection [`InFlightCalls`] counter with the call interceptor through
//! [`ConnectionInfo`], so a slow handler or a quiet `Watch` stream keeps its
//! connection alive past the timeout.

use crate::server::error::{HostError, Result};
use crate::server::interceptor::InFlightCalls;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::Stream;
use pin_project_lite::pin_project;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Sleep};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::{Connected, TcpConnectInfo};

/// A bound listen socket and the address it was configured with.
#[derive(Debug)]
pub struct ListenerBinding {
    addr: String,
    local_addr: SocketAddr,
    listener: TcpListener,
}

impl ListenerBinding {
    /// Binds `addr` (`host:port`). Failure is reported as
    /// [`HostError::Bind`] and is not retried.
    pub async fn bind(addr: &str) -> Result<Self> {
        let bind_err = |source| HostError::Bind {
            addr: addr.to_string(),
            source,
        };

        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        Ok(Self {
            addr: addr.to_string(),
            local_addr,
            listener,
        })
    }

    /// The address as configured.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The address actually bound; differs from [`addr`](Self::addr) when
    /// port `0` was requested.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stream of accepted connections, each closed after `idle_timeout`
    /// without I/O (`None` keeps connections open indefinitely).
    pub fn into_incoming(
        self,
        idle_timeout: Option<Duration>,
    ) -> impl Stream<Item = io::Result<IdleTimeoutStream<TcpStream>>> + Send + 'static {
        TcpListenerStream::new(self.listener).map(move |accepted| {
            accepted.map(|stream| {
                if let Err(_e) = stream.set_nodelay(true) {
                    tracing::debug!("failed to set TCP_NODELAY: {_e}");
                }
                if let Ok(peer) = stream.peer_addr() {
                    tracing::debug!(%peer, "connection accepted");
                }
                IdleTimeoutStream::new(stream, idle_timeout)
            })
        })
    }
}

struct IdleTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn touch(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.timeout);
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        self.sleep.as_mut().poll(cx).is_ready()
    }
}

pin_project! {
    /// Connection wrapper that fails pending reads with
    /// [`io::ErrorKind::TimedOut`] once no bytes have moved in either
    /// direction for the configured timeout.
    ///
    /// The timeout never fires while the connection has open calls.
    pub struct IdleTimeoutStream<IO> {
        #[pin]
        inner: IO,
        idle: Option<IdleTimer>,
        calls: InFlightCalls,
    }
}

impl<IO> IdleTimeoutStream<IO> {
    pub fn new(inner: IO, idle_timeout: Option<Duration>) -> Self {
        Self {
            inner,
            idle: idle_timeout.map(IdleTimer::new),
            calls: InFlightCalls::new(),
        }
    }

    pub fn get_ref(&self) -> &IO {
        &self.inner
    }

    /// Calls currently open on this connection.
    pub fn calls(&self) -> InFlightCalls {
        self.calls.clone()
    }
}

fn idle_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout")
}

impl<IO: AsyncRead> AsyncRead for IdleTimeoutStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if let Poll::Ready(res) = this.inner.poll_read(cx, buf) {
            if let Some(idle) = this.idle.as_mut() {
                idle.touch();
            }
            return Poll::Ready(res);
        }

        if let Some(idle) = this.idle.as_mut() {
            if idle.poll_expired(cx) {
                if this.calls.get() == 0 {
                    tracing::debug!("closing idle connection");
                    return Poll::Ready(Err(idle_error()));
                }
                // Busy: rearm so the timer wakes this task again.
                idle.touch();
                let _ = idle.poll_expired(cx);
            }
        }
        Poll::Pending
    }
}

impl<IO: AsyncWrite> AsyncWrite for IdleTimeoutStream<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write(cx, buf);
        if let (Poll::Ready(Ok(n)), Some(idle)) = (&res, this.idle) {
            if *n > 0 {
                idle.touch();
            }
        }
        res
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write_vectored(cx, bufs);
        if let (Poll::Ready(Ok(n)), Some(idle)) = (&res, this.idle) {
            if *n > 0 {
                idle.touch();
            }
        }
        res
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Connection details handed to every request on an accepted connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub remote: TcpConnectInfo,
    /// Calls open on the connection; read by its idle timer.
    pub calls: InFlightCalls,
}

impl Connected for IdleTimeoutStream<TcpStream> {
    type ConnectInfo = ConnectionInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        ConnectionInfo {
            remote: self.inner.connect_info(),
            calls: self.calls.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bind_reports_local_addr() {
        let binding = ListenerBinding::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(binding.addr(), "127.0.0.1:0");
        assert_ne!(binding.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn bind_fails_when_address_in_use() {
        let taken = ListenerBinding::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().to_string();

        let err = ListenerBinding::bind(&addr).await.unwrap_err();
        match err {
            HostError::Bind { addr: reported, source } => {
                assert_eq!(reported, addr);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn bind_fails_on_invalid_address() {
        let err = ListenerBinding::bind("not-an-address").await.unwrap_err();
        assert!(matches!(err, HostError::Bind { .. }));
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        let binding = ListenerBinding::bind("127.0.0.1:0").await.unwrap();
        let addr = binding.local_addr();
        let mut incoming = Box::pin(binding.into_incoming(Some(Duration::from_millis(50))));

        let _client = TcpStream::connect(addr).await.unwrap();
        let mut conn = incoming.next().await.unwrap().unwrap();

        let mut buf = [0_u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn traffic_keeps_connection_open() {
        let binding = ListenerBinding::bind("127.0.0.1:0").await.unwrap();
        let addr = binding.local_addr();
        let mut incoming = Box::pin(binding.into_incoming(Some(Duration::from_millis(200))));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut conn = incoming.next().await.unwrap().unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0_u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }
    }

    #[tokio::test]
    async fn open_call_defers_idle_close() {
        let binding = ListenerBinding::bind("127.0.0.1:0").await.unwrap();
        let addr = binding.local_addr();
        let mut incoming = Box::pin(binding.into_incoming(Some(Duration::from_millis(50))));

        let _client = TcpStream::connect(addr).await.unwrap();
        let mut conn = incoming.next().await.unwrap().unwrap();
        let info = conn.connect_info();
        assert_eq!(info.remote.local_addr(), Some(addr));

        let call = info.calls.enter();
        let mut buf = [0_u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(250), conn.read(&mut buf)).await;
        assert!(read.is_err(), "connection with an open call must stay up");

        drop(call);
        assert_eq!(conn.calls().get(), 0);
        let err = tokio::time::timeout(Duration::from_secs(1), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn no_timeout_when_disabled() {
        let binding = ListenerBinding::bind("127.0.0.1:0").await.unwrap();
        let addr = binding.local_addr();
        let mut incoming = Box::pin(binding.into_incoming(None));

        let _client = TcpStream::connect(addr).await.unwrap();
        let mut conn = incoming.next().await.unwrap().unwrap();

        let mut buf = [0_u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(100), conn.read(&mut buf)).await;
        assert!(read.is_err(), "read should still be pending");
    }
}
