//! In-process network
//!
//! Connects members running in the same process over duplex pipes. Used to
//! exercise multi-member behavior without sockets or certificates on disk.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{ConnectionHandler, Dialer, PeerConnection};
use crate::error::{Error, Result};

const PIPE_CAPACITY: usize = 256 * 1024;

struct Endpoint {
    certificate: Vec<u8>,
    handler: Weak<dyn ConnectionHandler>,
    up: bool,
    sessions: Vec<JoinHandle<()>>,
}

/// Registry of in-process members, keyed by address
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `handler` reachable at `address`, replacing any previous member there
    pub async fn register(&self, address: &str, certificate: &[u8], handler: Arc<dyn ConnectionHandler>) {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(previous) = endpoints.remove(address) {
            previous.sessions.iter().for_each(JoinHandle::abort);
        }
        endpoints.insert(
            address.to_string(),
            Endpoint {
                certificate: certificate.to_vec(),
                handler: Arc::downgrade(&handler),
                up: true,
                sessions: Vec::new(),
            },
        );
    }

    /// Dialer presenting `certificate` from `address`
    pub fn dialer(self: &Arc<Self>, address: &str, certificate: &[u8]) -> MemoryDialer {
        MemoryDialer {
            network: Arc::clone(self),
            address: address.to_string(),
            certificate: certificate.to_vec(),
        }
    }

    /// Simulate a member failing: drop its sessions and refuse new ones
    pub async fn take_down(&self, address: &str) {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get_mut(address) {
            endpoint.up = false;
            for session in endpoint.sessions.drain(..) {
                session.abort();
            }
            tracing::debug!("Took {} off the network", address);
        }
    }

    /// Make a previously downed member reachable again
    pub async fn bring_up(&self, address: &str) {
        if let Some(endpoint) = self.endpoints.lock().await.get_mut(address) {
            endpoint.up = true;
        }
    }
}

/// Dials other members of a [`MemoryNetwork`]
pub struct MemoryDialer {
    network: Arc<MemoryNetwork>,
    address: String,
    certificate: Vec<u8>,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, address: &str) -> Result<PeerConnection> {
        let refused = |reason: &str| Error::ConnectionFailed {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let mut endpoints = self.network.endpoints.lock().await;
        if endpoints.get(&self.address).is_some_and(|e| !e.up) {
            return Err(refused("local member is offline"));
        }

        let endpoint = endpoints
            .get_mut(address)
            .filter(|e| e.up)
            .ok_or_else(|| refused("no route to host"))?;
        let handler = endpoint
            .handler
            .upgrade()
            .ok_or_else(|| refused("connection refused"))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let client = PeerConnection::new(near, Some(endpoint.certificate.clone()), &self.address, address);
        let server = PeerConnection::new(far, Some(self.certificate.clone()), address, &self.address);

        endpoint.sessions.retain(|s| !s.is_finished());
        endpoint.sessions.push(tokio::spawn(handler.handle(server)));

        Ok(client)
    }
}
