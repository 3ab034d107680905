//! TCP connection and readiness waiting

use crate::readiness::{BlockDirections, Socket, WaitOutcome};
use crate::TransportError;
use async_trait::async_trait;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, trace};

/// Non-blocking TCP connection registered with the tokio reactor.
///
/// The transport library reads and writes a cloned descriptor of the same
/// socket directly; this side only waits for readiness.
#[derive(Debug)]
pub struct Connection {
    inner: AsyncFd<TcpStream>,
    peer: SocketAddr,
}

impl Connection {
    /// Connect to `host:port` within `timeout`.
    ///
    /// Returns the connection plus a clone of the stream to hand to the
    /// transport library.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(Self, TcpStream), TransportError> {
        debug!("Connecting to {}:{}", host, port);

        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connection(format!("{}:{}: {}", host, port, e)))?;

        stream.set_nodelay(true)?;
        let stream = stream.into_std()?;
        Self::from_std(stream)
    }

    /// Wrap an already-connected stream
    pub fn from_std(stream: TcpStream) -> Result<(Self, TcpStream), TransportError> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr()?;
        let library_side = stream.try_clone()?;
        let inner = AsyncFd::new(stream)?;

        debug!("Connected to {}", peer);
        Ok((Self { inner, peer }, library_side))
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

fn interest_for(directions: BlockDirections) -> Interest {
    match (directions.wants_read(), directions.wants_write()) {
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        // Unrecorded directions wait on either edge.
        _ => Interest::READABLE.add(Interest::WRITABLE),
    }
}

#[async_trait]
impl Socket for Connection {
    async fn wait_ready(
        &self,
        directions: BlockDirections,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        trace!("Waiting for {:?} on {}", directions, self.peer);

        let ready = self.inner.ready(interest_for(directions));
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, ready).await {
                Ok(result) => result,
                Err(_) => return WaitOutcome::TimedOut,
            },
            None => ready.await,
        };

        match result {
            Ok(mut guard) => {
                // The library does its own reads; the next wait must see a fresh edge.
                guard.clear_ready();
                WaitOutcome::Ready
            }
            Err(e) => WaitOutcome::Failed(e),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.inner.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}
