//! Configuration Store
//!
//! The replicated state of the collective: a key/value table, the member
//! table, collective-wide globals and opaque key material, all versioned by
//! a single transaction counter.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::trust::Fingerprint;

/// Monotonic count of committed transactions
pub type TxCount = u64;

/// Member name to member record
pub type MemberTable = BTreeMap<String, Member>;

/// Collective-wide settings
pub type GlobalTable = BTreeMap<String, String>;

/// Global recording the identity of the collective
pub const COLLECTIVE_UUID: &str = "collective_uuid";

/// A collective member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member name
    pub name: String,
    /// Last observed network address (host only)
    pub address: String,
    /// Pinned certificate fingerprint
    pub fingerprint: Fingerprint,
    /// When the member was enrolled
    pub enrolled_at: DateTime<Utc>,
}

impl Member {
    pub fn new(name: &str, address: &str, fingerprint: Fingerprint) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            fingerprint,
            enrolled_at: Utc::now(),
        }
    }
}

/// Opaque key material shared by every member
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyMaterial(pub Vec<u8>);

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

/// Full export of the store, as sent to a new follower
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub keys: KeyMaterial,
    pub members: MemberTable,
    pub globals: GlobalTable,
    pub txcount: TxCount,
    /// Serialized key/value table
    pub data: Vec<u8>,
}

/// A replicated change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOp {
    Set { key: String, value: String },
    Delete { key: String },
    SetGlobal { name: String, value: String },
    AddMember(Member),
    UpdateMemberAddress { name: String, address: String },
    RemoveMember { name: String },
}

/// A committed change and the counter value it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txcount: TxCount,
    pub op: TxOp,
}

/// Storage backend for the replicated collective state
///
/// Writes made through the commit methods bump the counter and are published
/// on the transaction feed. A store marked read-only (while following) rejects
/// them with `Error::ReadOnly`; followers change state only through
/// `restore` and `apply`.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current transaction counter
    async fn txcount(&self) -> TxCount;

    /// Member table
    async fn members(&self) -> MemberTable;

    /// Look up a member by name
    async fn member(&self, name: &str) -> Option<Member>;

    /// Look up a member by last known address
    async fn member_by_address(&self, address: &str) -> Option<Member>;

    /// Enroll (or re-enroll) a member
    async fn add_member(&self, member: Member) -> Result<TxCount>;

    /// Record a newly observed address for a member
    async fn update_member_address(&self, name: &str, address: &str) -> Result<TxCount>;

    /// Remove a member
    async fn remove_member(&self, name: &str) -> Result<TxCount>;

    /// Collective-wide settings
    async fn globals(&self) -> GlobalTable;

    /// Read one global
    async fn global(&self, name: &str) -> Option<String>;

    /// Set a global
    async fn set_global(&self, name: &str, value: &str) -> Result<TxCount>;

    /// Read a key
    async fn get(&self, key: &str) -> Option<String>;

    /// Write a key
    async fn set(&self, key: &str, value: &str) -> Result<TxCount>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<TxCount>;

    /// All keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)>;

    /// Shared key material
    async fn dump_keys(&self) -> KeyMaterial;

    /// Export everything a follower needs
    async fn export(&self) -> Result<Snapshot>;

    /// Replace the whole state with a snapshot; on failure nothing changes
    async fn restore(&self, snapshot: Snapshot) -> Result<()>;

    /// Apply a transaction relayed by the leader
    async fn apply(&self, tx: Transaction) -> Result<()>;

    /// Subscribe to committed transactions
    fn subscribe(&self) -> broadcast::Receiver<Transaction>;

    /// Mark the store read-only while following a leader
    async fn set_read_only(&self, read_only: bool);

    async fn is_read_only(&self) -> bool;
}
