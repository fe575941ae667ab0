//! Network Module
//!
//! Framed, mutually authenticated sessions between collective members.

mod memory;
mod server;
mod tls;

pub use memory::{MemoryDialer, MemoryNetwork};
pub use server::CollectiveServer;
pub use tls::TlsTransport;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::replication::protocol::{self, FrameHeader, Request, MAX_FRAME_SIZE};
use crate::replication::Message;

/// Read a framed message from a reader
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("record of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Byte stream a session runs over
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Stream for T {}

/// An authenticated session with another member
pub struct PeerConnection {
    stream: Box<dyn Stream>,
    peer_certificate: Option<Vec<u8>>,
    local_address: String,
    peer_address: String,
    timeout: Duration,
}

impl PeerConnection {
    /// Wrap an established stream
    pub fn new(
        stream: impl Stream + 'static,
        peer_certificate: Option<Vec<u8>>,
        local_address: impl Into<String>,
        peer_address: impl Into<String>,
    ) -> Self {
        Self {
            stream: Box::new(stream),
            peer_certificate,
            local_address: local_address.into(),
            peer_address: peer_address.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// DER certificate the peer presented
    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }

    /// Our address as seen on this connection
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// The peer's address as seen on this connection
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Idle timeout applied to every read
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send one record
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        tracing::trace!("Sending {} to {}", message.type_name(), self.peer_address);
        match tokio::time::timeout(self.timeout, write_message(&mut self.stream, message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(self.peer_address.clone())),
        }
    }

    /// Receive one record
    pub async fn recv(&mut self) -> Result<Message> {
        match tokio::time::timeout(self.timeout, read_message(&mut self.stream)).await {
            Ok(result) => {
                let message = result?;
                tracing::trace!("Received {} from {}", message.type_name(), self.peer_address);
                Ok(message)
            }
            Err(_) => Err(Error::ConnectionTimeout(self.peer_address.clone())),
        }
    }

    /// Send raw bytes following a size-announcing record
    pub async fn send_payload(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(data).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result.map_err(Error::Io),
            Err(_) => Err(Error::ConnectionTimeout(self.peer_address.clone())),
        }
    }

    /// Receive exactly `len` raw bytes
    pub async fn recv_payload(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!("payload of {} bytes exceeds limit", len)));
        }

        let mut data = vec![0u8; len];
        match tokio::time::timeout(self.timeout, self.stream.read_exact(&mut data)).await {
            Ok(Ok(_)) => Ok(data),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::ConnectionTimeout(self.peer_address.clone())),
        }
    }

    /// Accepting side: announce product, version and authentication result
    pub async fn greet(&mut self) -> Result<()> {
        self.send(&Message::Banner(protocol::banner())).await?;
        self.send(&Message::AuthStatus { passed: true }).await
    }

    /// Connecting side: validate the banner and authentication result
    pub async fn expect_greeting(&mut self) -> Result<()> {
        match self.recv().await? {
            Message::Banner(banner) => {
                protocol::check_banner(&banner)?;
            }
            other => {
                return Err(Error::Protocol(format!("expected banner, got {}", other.type_name())));
            }
        }

        match self.recv().await? {
            Message::AuthStatus { passed: true } => Ok(()),
            Message::AuthStatus { passed: false } => {
                Err(Error::CertificateMismatch(self.peer_address.clone()))
            }
            other => Err(Error::Protocol(format!(
                "expected authentication status, got {}",
                other.type_name()
            ))),
        }
    }

    /// Connecting side: check the greeting, send a request and read the reply
    pub async fn request(&mut self, request: Request) -> Result<Message> {
        self.expect_greeting().await?;
        self.send(&Message::Request(request)).await?;
        self.recv().await
    }

    /// Resolve once the peer closes the stream (or sends something unexpected)
    pub async fn closed(&mut self) {
        let mut probe = [0u8; 1];
        match self.stream.read(&mut probe).await {
            Ok(0) => {}
            Ok(_) => tracing::warn!("Unexpected data on stream from {}", self.peer_address),
            Err(e) => tracing::debug!("Stream from {} failed: {}", self.peer_address, e),
        }
    }

    /// Close the session
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("local_address", &self.local_address)
            .field("peer_address", &self.peer_address)
            .finish()
    }
}

/// Opens authenticated sessions to other members
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to the member listening at `address`
    async fn dial(&self, address: &str) -> Result<PeerConnection>;
}

/// Serves sessions accepted from other members
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(self: Arc<Self>, conn: PeerConnection);
}

/// Dial many members with at most `concurrency` attempts in flight,
/// yielding results in the order the addresses were given
pub fn dial_all(
    dialer: Arc<dyn Dialer>,
    addresses: Vec<String>,
    concurrency: usize,
) -> BoxStream<'static, (String, Result<PeerConnection>)> {
    futures::stream::iter(addresses)
        .map(move |address| {
            let dialer = Arc::clone(&dialer);
            async move {
                let result = dialer.dial(&address).await;
                (address, result)
            }
        })
        .buffered(concurrency.max(1))
        .boxed()
}
