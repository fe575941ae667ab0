//! Collective Server
//!
//! Accepts TLS connections from other members on the collective port.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::{ConnectionHandler, TlsTransport};
use crate::error::Result;

/// Listener for the collective port
pub struct CollectiveServer {
    /// Bind address
    bind_address: String,
    /// Handshake side of the transport
    transport: Arc<TlsTransport>,
    /// Serves each authenticated session
    handler: Arc<dyn ConnectionHandler>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl CollectiveServer {
    /// Create a new collective server
    pub fn new(
        bind_address: String,
        transport: Arc<TlsTransport>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            transport,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Start the server
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Collective server listening on {}", self.bind_address);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let transport = Arc::clone(&self.transport);
                            let handler = Arc::clone(&self.handler);

                            tokio::spawn(async move {
                                serve(socket, addr.to_string(), transport, handler).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Collective server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Complete the handshake and pass the session on
async fn serve(
    socket: TcpStream,
    peer_addr: String,
    transport: Arc<TlsTransport>,
    handler: Arc<dyn ConnectionHandler>,
) {
    let _ = socket.set_nodelay(true);
    match transport.accept(socket).await {
        Ok(conn) if conn.peer_certificate().is_some() => handler.handle(conn).await,
        Ok(_) => tracing::warn!("Rejecting connection from {} without a certificate", peer_addr),
        Err(e) => tracing::warn!("TLS handshake with {} failed: {}", peer_addr, e),
    }
}
