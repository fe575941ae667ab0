//! WolfCollective - Collective Membership for Management Servers
//!
//! Keeps a group of management servers agreed on one authoritative
//! configuration store. One member leads and accepts writes; the others
//! follow its transaction stream read-only and take over if it disappears.
//!
//! # Architecture
//!
//! Members authenticate each other over mutual TLS by pinned certificate
//! fingerprints. Leadership is settled by comparing transaction counters,
//! then follower counts, then member names. New members are enrolled with
//! one-time invitations.
//!
//! # Features
//!
//! - Leader arbitration without split-brain between simultaneous peers
//! - Snapshot transfer followed by a live transaction stream
//! - Automatic recovery with jittered, non-stacking retries
//! - Quorum checks gating administrative changes
//! - Rebalancing of managed nodes away from offline members
//! - Invitation based enrollment with certificate-bound proofs
//! - HTTP API for local administration

pub mod api;
pub mod collective;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod identity;
pub mod network;
pub mod rebalance;
pub mod recovery;
pub mod replication;
pub mod state;
pub mod store;
pub mod trust;

pub use collective::Collective;
pub use config::CollectiveConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::collective::{Collective, StatusReport};
    pub use crate::config::{CollectiveConfig, ProtocolConfig};
    pub use crate::error::{Error, Result};
    pub use crate::identity::{LocalIdentity, NameCache};
    pub use crate::network::{Dialer, MemoryNetwork, PeerConnection, TlsTransport};
    pub use crate::rebalance::{NodeInventory, StoreInventory};
    pub use crate::replication::{CollectiveInfo, Message};
    pub use crate::state::Role;
    pub use crate::store::{ConfigStore, MemoryStore, Member};
    pub use crate::trust::Fingerprint;
}
