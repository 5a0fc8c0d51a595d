use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use lanpush_core::listener::Connection;

const PIPE_CAPACITY: usize = 64 * 1024;

/// One end of an in-memory byte pipe implementing [`Connection`].
///
/// Used to run the handshake and the transfer protocol end-to-end without
/// sockets.
pub struct MemoryConnection {
    stream: DuplexStream,
    peer_addr: SocketAddr,
}

impl MemoryConnection {
    /// Two connected ends that both report `127.0.0.1` as their peer.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (left, right) = tokio::io::duplex(PIPE_CAPACITY);
        (
            Self {
                stream: left,
                peer_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 40_000)),
            },
            Self {
                stream: right,
                peer_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 40_001)),
            },
        )
    }
}

impl Connection for MemoryConnection {
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
                .context("failed to read from in-memory connection")?;
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
                .context("failed to write to in-memory connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down in-memory connection")
        }
    }
}
