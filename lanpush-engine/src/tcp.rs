use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net;
use tracing::{debug, info};

use lanpush_core::listener::{Connection, Connector, Listener, ListenerFactory};

/// A transfer connection over a [`tokio::net::TcpStream`].
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: SocketAddr,
}

impl TcpConnection {
    fn new(stream: net::TcpStream, peer_addr: SocketAddr) -> Self {
        // Handshake packets are single bytes; don't let Nagle hold them back.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "Could not disable Nagle");
        }
        Self { stream, peer_addr }
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> String {
        self.peer_addr.to_string()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn read_exact<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .read_exact(buf)
                .await
                .context("failed to read from TCP connection")?;
            Ok(())
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to TCP connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down TCP connection")
        }
    }
}

/// A TCP listener wrapping a [`tokio::net::TcpListener`].
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: String,
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            debug!(peer = %addr, "Accepted TCP connection");
            Ok(TcpConnection::new(stream, addr))
        }
    }
}

/// Binds [`TcpListener`]s for the transfer port.
pub struct TcpListenerFactory;

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();
            info!(addr = %local_addr, "TCP listener bound");
            Ok(TcpListener { inner, local_addr })
        }
    }
}

/// Opens outbound transfer connections, giving up after `timeout`.
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let stream = tokio::time::timeout(self.timeout, net::TcpStream::connect(addr))
                .await
                .with_context(|| {
                    format!("connecting to {addr} timed out after {} ms", self.timeout.as_millis())
                })?
                .with_context(|| format!("failed to connect to {addr}"))?;
            debug!(peer = %addr, "Connected");
            Ok(TcpConnection::new(stream, addr))
        }
    }
}
