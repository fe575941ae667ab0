//! In-memory configuration store with optional JSON persistence

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};

use super::{
    ConfigStore, GlobalTable, KeyMaterial, Member, MemberTable, Snapshot, Transaction, TxCount,
    TxOp,
};
use crate::error::{Error, Result};

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    txcount: TxCount,
    keys: KeyMaterial,
    members: MemberTable,
    globals: GlobalTable,
    data: BTreeMap<String, String>,
}

/// Configuration store held in memory and mirrored to a JSON file
///
/// Every change is staged on a copy, written to disk, then swapped in, so a
/// failed write (or a corrupt snapshot) leaves the previous state untouched.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    read_only: AtomicBool,
    feed: broadcast::Sender<Transaction>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create a store that is never persisted
    pub fn new() -> Self {
        Self::with_state(fresh_state(), None)
    }

    /// Open (or create) a store persisted at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read(&path).await?;
            serde_json::from_slice(&content)?
        } else {
            let state = fresh_state();
            write_state(&path, &state).await?;
            state
        };

        tracing::debug!("Opened configuration store at {:?}", path);
        Ok(Self::with_state(state, Some(path)))
    }

    fn with_state(state: StoreState, path: Option<PathBuf>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: RwLock::new(state),
            read_only: AtomicBool::new(false),
            feed,
            path,
        }
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        match &self.path {
            Some(path) => write_state(path, state).await,
            None => Ok(()),
        }
    }

    /// Commit a local change and publish it to the transaction feed
    async fn commit(&self, op: TxOp) -> Result<TxCount> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }

        let mut state = self.state.write().await;
        let mut staged = state.clone();
        apply_op(&mut staged, &op)?;
        staged.txcount += 1;
        self.persist(&staged).await?;
        *state = staged;

        let txcount = state.txcount;
        // No subscribers simply means no followers
        let _ = self.feed.send(Transaction { txcount, op });
        Ok(txcount)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_state() -> StoreState {
    StoreState {
        keys: KeyMaterial(rand::random::<[u8; 32]>().to_vec()),
        ..Default::default()
    }
}

async fn write_state(path: &Path, state: &StoreState) -> Result<()> {
    let content = serde_json::to_vec_pretty(state)?;
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, content).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

fn apply_op(state: &mut StoreState, op: &TxOp) -> Result<()> {
    match op {
        TxOp::Set { key, value } => {
            state.data.insert(key.clone(), value.clone());
        }
        TxOp::Delete { key } => {
            state.data.remove(key);
        }
        TxOp::SetGlobal { name, value } => {
            state.globals.insert(name.clone(), value.clone());
        }
        TxOp::AddMember(member) => {
            state.members.insert(member.name.clone(), member.clone());
        }
        TxOp::UpdateMemberAddress { name, address } => {
            let member = state
                .members
                .get_mut(name)
                .ok_or_else(|| Error::UnknownMember(name.clone()))?;
            member.address = address.clone();
        }
        TxOp::RemoveMember { name } => {
            state
                .members
                .remove(name)
                .ok_or_else(|| Error::UnknownMember(name.clone()))?;
        }
    }
    Ok(())
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn txcount(&self) -> TxCount {
        self.state.read().await.txcount
    }

    async fn members(&self) -> MemberTable {
        self.state.read().await.members.clone()
    }

    async fn member(&self, name: &str) -> Option<Member> {
        self.state.read().await.members.get(name).cloned()
    }

    async fn member_by_address(&self, address: &str) -> Option<Member> {
        self.state
            .read()
            .await
            .members
            .values()
            .find(|m| m.address == address)
            .cloned()
    }

    async fn add_member(&self, member: Member) -> Result<TxCount> {
        if member.name.is_empty() || member.name.contains('@') {
            return Err(Error::Store(format!("invalid member name '{}'", member.name)));
        }
        self.commit(TxOp::AddMember(member)).await
    }

    async fn update_member_address(&self, name: &str, address: &str) -> Result<TxCount> {
        if let Some(member) = self.member(name).await {
            if member.address == address {
                return Ok(self.txcount().await);
            }
        }
        self.commit(TxOp::UpdateMemberAddress {
            name: name.to_string(),
            address: address.to_string(),
        })
        .await
    }

    async fn remove_member(&self, name: &str) -> Result<TxCount> {
        self.commit(TxOp::RemoveMember { name: name.to_string() }).await
    }

    async fn globals(&self) -> GlobalTable {
        self.state.read().await.globals.clone()
    }

    async fn global(&self, name: &str) -> Option<String> {
        self.state.read().await.globals.get(name).cloned()
    }

    async fn set_global(&self, name: &str, value: &str) -> Result<TxCount> {
        self.commit(TxOp::SetGlobal {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.state.read().await.data.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) -> Result<TxCount> {
        self.commit(TxOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<TxCount> {
        self.commit(TxOp::Delete { key: key.to_string() }).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.state
            .read()
            .await
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn dump_keys(&self) -> KeyMaterial {
        self.state.read().await.keys.clone()
    }

    async fn export(&self) -> Result<Snapshot> {
        let state = self.state.read().await;
        Ok(Snapshot {
            keys: state.keys.clone(),
            members: state.members.clone(),
            globals: state.globals.clone(),
            txcount: state.txcount,
            data: serde_json::to_vec(&state.data)?,
        })
    }

    async fn restore(&self, snapshot: Snapshot) -> Result<()> {
        // A leader with nothing in its key/value table may send no data at all
        let data: BTreeMap<String, String> = if snapshot.data.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(&snapshot.data)
                .map_err(|e| Error::SnapshotRestore(format!("corrupt key/value table: {}", e)))?
        };

        if let Some((key, member)) = snapshot.members.iter().find(|(k, m)| **k != m.name) {
            return Err(Error::SnapshotRestore(format!(
                "member table entry '{}' names '{}'",
                key, member.name
            )));
        }

        let staged = StoreState {
            txcount: snapshot.txcount,
            keys: snapshot.keys,
            members: snapshot.members,
            globals: snapshot.globals,
            data,
        };

        let mut state = self.state.write().await;
        self.persist(&staged)
            .await
            .map_err(|e| Error::SnapshotRestore(format!("failed to persist snapshot: {}", e)))?;
        *state = staged;

        tracing::info!("Restored configuration snapshot at transaction {}", state.txcount);
        Ok(())
    }

    async fn apply(&self, tx: Transaction) -> Result<()> {
        let mut state = self.state.write().await;
        if tx.txcount <= state.txcount {
            tracing::debug!("Skipping already applied transaction {}", tx.txcount);
            return Ok(());
        }

        let mut staged = state.clone();
        apply_op(&mut staged, &tx.op)?;
        staged.txcount = tx.txcount;
        self.persist(&staged).await?;
        *state = staged;

        let _ = self.feed.send(tx);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Transaction> {
        self.feed.subscribe()
    }

    async fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    async fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}
