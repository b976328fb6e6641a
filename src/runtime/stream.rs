use std::{
    fmt::Debug,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Transport for T {}

/// A byte stream to a server that connections exchange messages over.
pub struct AsyncStream {
    inner: Box<dyn Transport>,
}

impl AsyncStream {
    /// Wrap any bidirectional byte stream.
    pub fn new(inner: impl AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl Debug for AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncStream").finish()
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for AsyncStream {
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

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Opens byte streams to servers. Both application connections and monitoring connections are
/// created through the connector configured on the client.
pub trait StreamConnector: Send + Sync + Debug {
    /// Open a stream to `address`, giving up after `connect_timeout` if one is set.
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
        connect_timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<AsyncStream>>;
}

/// The default connector, which opens plain TCP streams with `TCP_NODELAY` set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl StreamConnector for TcpConnector {
    fn connect<'a>(
        &'a self,
        address: &'a ServerAddress,
        connect_timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<AsyncStream>> {
        Box::pin(async move {
            let stream = tcp_connect(address, connect_timeout).await?;
            Ok(AsyncStream::new(stream))
        })
    }
}

async fn try_connect(address: &SocketAddr, timeout: Duration) -> Result<TcpStream> {
    // A zero timeout means no timeout.
    let stream = if timeout.is_zero() {
        TcpStream::connect(address).await?
    } else {
        crate::runtime::timeout(timeout, TcpStream::connect(address)).await??
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn tcp_connect(address: &ServerAddress, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let mut socket_addrs: Vec<_> = tokio::net::lookup_host(address.to_string())
        .await?
        .collect();

    if socket_addrs.is_empty() {
        return Err(ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no DNS results for {}", address),
        )))
        .into());
    }

    // Try each of the addresses in sequence with a preference for IPv4.
    socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error: Option<Error> = None;
    for socket_addr in &socket_addrs {
        connect_error = match try_connect(socket_addr, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(err) => Some(err),
        };
    }

    Err(connect_error.unwrap_or_else(|| Error::network(format!("could not connect to {}", address))))
}
