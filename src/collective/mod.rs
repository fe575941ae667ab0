//! Collective Manager
//!
//! Ties membership, trust, replication and recovery together. Every member
//! runs one `Collective`: it serves inbound sessions from its peers, finds
//! or becomes the leader at startup, follows the leader's transaction
//! stream, and recovers when the leader disappears.

mod admin;
mod connect;
mod inbound;
mod leadership;
mod startup;

pub use admin::StatusReport;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProtocolConfig;
use crate::enrollment::InvitationRegistry;
use crate::error::Result;
use crate::identity::{LocalIdentity, NameCache};
use crate::network::{ConnectionHandler, Dialer, PeerConnection};
use crate::rebalance::NodeInventory;
use crate::recovery::{jittered, TaskSlot};
use crate::replication::CollectiveInfo;
use crate::state::{self, natural_cmp, ClusterState, QuorumView, Role};
use crate::store::ConfigStore;
use crate::trust::{Fingerprint, TrustVerifier};

/// Collective membership manager for this member
pub struct Collective {
    pub(crate) name: NameCache,
    pub(crate) identity: LocalIdentity,
    pub(crate) store: Arc<dyn ConfigStore>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) inventory: Arc<dyn NodeInventory>,
    pub(crate) invites: InvitationRegistry,
    pub(crate) state: ClusterState,
    pub(crate) config: ProtocolConfig,
    /// Startup / recovery retry
    pub(crate) retry: Arc<TaskSlot>,
    /// Debounced manager rebalance
    pub(crate) rebalance: Arc<TaskSlot>,
    /// Periodic scan for members that are not following us
    pub(crate) reassimilate: Arc<TaskSlot>,
    stopped: AtomicBool,
}

impl Collective {
    /// Create a new collective manager
    pub fn new(
        name: NameCache,
        identity: LocalIdentity,
        store: Arc<dyn ConfigStore>,
        dialer: Arc<dyn Dialer>,
        inventory: Arc<dyn NodeInventory>,
        config: ProtocolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            identity,
            store,
            dialer,
            inventory,
            invites: InvitationRegistry::new(),
            state: ClusterState::new(),
            config,
            retry: TaskSlot::new("collective retry"),
            rebalance: TaskSlot::new("manager rebalance"),
            reassimilate: TaskSlot::new("reassimilation"),
            stopped: AtomicBool::new(false),
        })
    }

    /// Our member name
    pub async fn myname(&self) -> String {
        self.name.get().await
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// The replicated configuration store
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub async fn role(&self) -> Role {
        self.state.role().await
    }

    /// Address of the current leader
    pub async fn leader(&self) -> Option<String> {
        self.state.leader().await
    }

    /// Whether we are following a live leader stream
    pub async fn is_following(&self) -> bool {
        self.state.has_follower().await
    }

    /// Fail with `DegradedCollective` unless our view is authoritative
    pub async fn check_quorum(&self) -> Result<()> {
        let view = QuorumView {
            role: self.state.role().await,
            members: self.store.members().await.len(),
            followers: self.state.relay_count().await,
            following: self.state.has_follower().await,
        };
        state::check_quorum(&view)
    }

    /// Collective view as seen by this member while leading
    pub async fn collective_info(&self) -> CollectiveInfo {
        let myname = self.myname().await;
        let mut active = self.state.relay_names().await;
        active.sort_by(|a, b| natural_cmp(a, b));

        let mut offline: Vec<String> = self
            .store
            .members()
            .await
            .into_keys()
            .filter(|name| *name != myname && !active.contains(name))
            .collect();
        offline.sort_by(|a, b| natural_cmp(a, b));

        CollectiveInfo {
            leader: myname,
            active,
            offline,
            quorum: None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop all collective activity
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.retry.cancel().await;
        self.rebalance.cancel().await;
        self.reassimilate.cancel().await;
        self.state.take_follower().await;
        let relays = self.state.stop_relays(None).await;
        self.state.set_leader(None).await;
        self.state.set_role(Role::Uninitialized).await;

        tracing::info!("Collective manager stopped ({} followers released)", relays);
    }

    /// Check the certificate on `conn` against a pinned digest or, without
    /// one, against the member recorded for `address`
    pub(crate) async fn verify_peer(
        &self,
        address: &str,
        pinned: Option<&Fingerprint>,
        conn: &PeerConnection,
    ) -> Result<()> {
        match pinned {
            Some(fingerprint) => {
                TrustVerifier::verify_pinned(fingerprint, conn.peer_certificate(), address)
            }
            None => TrustVerifier::new(self.store.as_ref())
                .verify_address(address, conn.peer_certificate())
                .await
                .map(|_| ()),
        }
    }

    /// Base delay plus jitter, for retries after a failed round
    pub(crate) fn retry_delay(&self) -> Duration {
        jittered(self.config.retry_base_delay(), self.jitter())
    }

    /// Jitter alone, for retries after losing a leader or a handoff
    pub(crate) fn short_delay(&self) -> Duration {
        jittered(Duration::ZERO, self.jitter())
    }

    fn jitter(&self) -> Duration {
        Duration::from_millis(self.config.retry_jitter_ms)
    }
}

#[async_trait]
impl ConnectionHandler for Collective {
    async fn handle(self: Arc<Self>, conn: PeerConnection) {
        self.handle_connection(conn).await;
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::network::MemoryNetwork;
    use crate::rebalance::StoreInventory;
    use crate::replication::Message;
    use crate::store::{Member, MemoryStore};

    pub const ALPHA: &str = "10.0.0.1";
    pub const BETA: &str = "10.0.0.2";
    pub const GAMMA: &str = "10.0.0.3";

    pub fn certificate(name: &str) -> Vec<u8> {
        format!("{}-certificate", name).into_bytes()
    }

    /// Greets, then answers every request with the same reply
    pub struct Canned {
        reply: Message,
        requests: AtomicUsize,
    }

    impl Canned {
        pub fn new(reply: impl Into<Message>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.into(),
                requests: AtomicUsize::new(0),
            })
        }

        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectionHandler for Canned {
        async fn handle(self: Arc<Self>, mut conn: PeerConnection) {
            if conn.greet().await.is_err() {
                return;
            }
            if let Ok(Message::Request(_)) = conn.recv().await {
                self.requests.fetch_add(1, Ordering::SeqCst);
                let _ = conn.send(&self.reply).await;
            }
        }
    }

    /// gamma at 10.0.0.3, knowing alpha and beta at 10.0.0.1 and 10.0.0.2
    pub async fn gamma(network: &Arc<MemoryNetwork>, config: ProtocolConfig) -> Arc<Collective> {
        let store = Arc::new(MemoryStore::new());
        for (name, address) in [("alpha", ALPHA), ("beta", BETA), ("gamma", GAMMA)] {
            let fingerprint = Fingerprint::of_certificate(&certificate(name));
            store.add_member(Member::new(name, address, fingerprint)).await.unwrap();
        }

        let collective = Collective::new(
            NameCache::fixed("gamma"),
            LocalIdentity::new(certificate("gamma")),
            store.clone(),
            Arc::new(network.dialer(GAMMA, &certificate("gamma"))),
            Arc::new(StoreInventory::new(store)),
            config,
        );
        network.register(GAMMA, &certificate("gamma"), collective.clone()).await;
        collective
    }
}
