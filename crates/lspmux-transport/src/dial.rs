//! The dial capability — how raw backend transports are established.
//!
//! The proxy core never opens sockets itself; it asks a [`Dialer`] for a
//! duplex byte stream keyed by the connection identity. Production wiring
//! uses [`TcpDialer`]; tests inject in-memory streams.

use std::collections::HashMap;
use std::pin::Pin;

use lspmux_protocol::ServerId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A duplex byte stream to a backend, type-erased.
pub type BoxedStream = Box<dyn Duplex>;

pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// Establishes the raw transport to the backend serving `id`.
pub trait Dialer: Send + Sync + 'static {
    fn dial(
        &self,
        id: &ServerId,
    ) -> impl std::future::Future<Output = std::io::Result<BoxedStream>> + Send;
}

/// Object-safe wrapper for the Dialer trait.
pub trait DialerDyn: Send + Sync {
    fn dial_dyn<'a>(
        &'a self,
        id: &'a ServerId,
    ) -> Pin<Box<dyn std::future::Future<Output = std::io::Result<BoxedStream>> + Send + 'a>>;
}

impl<T: Dialer> DialerDyn for T {
    fn dial_dyn<'a>(
        &'a self,
        id: &'a ServerId,
    ) -> Pin<Box<dyn std::future::Future<Output = std::io::Result<BoxedStream>> + Send + 'a>> {
        Box::pin(self.dial(id))
    }
}

/// Dials backends over TCP from a mode → address table.
pub struct TcpDialer {
    addrs: HashMap<String, String>,
}

impl TcpDialer {
    pub fn new(addrs: HashMap<String, String>) -> Self {
        Self { addrs }
    }

    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.addrs.keys().map(|s| s.as_str())
    }
}

impl Dialer for TcpDialer {
    async fn dial(&self, id: &ServerId) -> std::io::Result<BoxedStream> {
        let addr = self.addrs.get(id.mode()).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no backend registered for mode {:?}", id.mode()),
            )
        })?;
        debug!("dialing {addr} for {id}");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
