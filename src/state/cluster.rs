//! Collective State
//!
//! Role, current leader, the follower task and the set of relays this member
//! serves while leading, plus the gates serializing connection setup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{oneshot, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;

/// Role of this member in the collective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Not yet part of an active collective
    Uninitialized,
    /// Looking for a leader
    Connecting,
    /// Following a leader
    Follower,
    /// Leading the collective
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Uninitialized => write!(f, "UNINITIALIZED"),
            Role::Connecting => write!(f, "CONNECTING"),
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Leader => write!(f, "LEADER"),
        }
    }
}

/// A mutex whose "held" state can be observed without waiting on it
pub struct Gate {
    name: &'static str,
    lock: Mutex<()>,
    active: AtomicBool,
}

/// Held gate; releases on drop
pub struct GateGuard<'a> {
    gate: &'a Gate,
    _guard: MutexGuard<'a, ()>,
}

impl Gate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: Mutex::new(()),
            active: AtomicBool::new(false),
        }
    }

    /// Whether someone currently holds the gate
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for and take the gate
    pub async fn enter(&self) -> GateGuard<'_> {
        let guard = self.lock.lock().await;
        self.active.store(true, Ordering::SeqCst);
        tracing::trace!("Entered {} gate", self.name);
        GateGuard { gate: self, _guard: guard }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.active.store(false, Ordering::SeqCst);
    }
}

/// The background task consuming the leader's stream
struct FollowerTask {
    id: u64,
    leader: String,
    handle: JoinHandle<()>,
}

/// Control handle for one follower stream served while leading
struct Relay {
    id: u64,
    stop: oneshot::Sender<Option<String>>,
}

/// Stop signal delivered to a relay; carries the leader to redirect to
pub type RelayStop = oneshot::Receiver<Option<String>>;

/// Mutable collective state of this member
pub struct ClusterState {
    role: RwLock<Role>,
    leader: RwLock<Option<String>>,
    follower: Mutex<Option<FollowerTask>>,
    relays: Mutex<BTreeMap<String, Relay>>,
    /// Held while establishing an outbound follower connection
    pub connecting: Gate,
    /// Held while a snapshot is sent or installed
    pub leader_init: Gate,
    initting: AtomicBool,
    ids: AtomicU64,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            role: RwLock::new(Role::Uninitialized),
            leader: RwLock::new(None),
            follower: Mutex::new(None),
            relays: Mutex::new(BTreeMap::new()),
            connecting: Gate::new("connecting"),
            leader_init: Gate::new("leader_init"),
            initting: AtomicBool::new(true),
            ids: AtomicU64::new(1),
        }
    }

    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    pub async fn set_role(&self, role: Role) {
        let mut current = self.role.write().await;
        if *current != role {
            tracing::debug!("Collective role {} -> {}", *current, role);
            *current = role;
        }
    }

    /// Address of the current leader (our own address while leading)
    pub async fn leader(&self) -> Option<String> {
        self.leader.read().await.clone()
    }

    pub async fn set_leader(&self, leader: Option<String>) {
        *self.leader.write().await = leader;
    }

    /// Startup sequence in progress
    pub fn is_initting(&self) -> bool {
        self.initting.load(Ordering::SeqCst)
    }

    pub fn set_initting(&self, initting: bool) {
        self.initting.store(initting, Ordering::SeqCst);
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }

    // ========== Follower Task ==========

    /// Spawn the follower task; the slot must be empty (see `take_follower`)
    pub async fn spawn_follower<F, Fut>(&self, leader: &str, task: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.follower.lock().await;
        let id = self.next_id();
        let handle = tokio::spawn(task(id));
        if let Some(previous) = slot.replace(FollowerTask {
            id,
            leader: leader.to_string(),
            handle,
        }) {
            previous.handle.abort();
        }
    }

    /// Cancel the follower task, returning the leader it followed
    pub async fn take_follower(&self) -> Option<String> {
        let task = self.follower.lock().await.take()?;
        task.handle.abort();
        Some(task.leader)
    }

    /// Called by the follower task itself as it exits
    pub async fn release_follower(&self, id: u64) -> bool {
        let mut slot = self.follower.lock().await;
        if slot.as_ref().is_some_and(|t| t.id == id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Whether a live follower task exists
    pub async fn has_follower(&self) -> bool {
        self.follower
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    // ========== Relays ==========

    /// Register a relay for `name`, displacing an older relay for the same member
    pub async fn register_relay(&self, name: &str) -> (u64, RelayStop) {
        let (stop, stopped) = oneshot::channel();
        let id = self.next_id();
        let mut relays = self.relays.lock().await;
        if let Some(previous) = relays.insert(name.to_string(), Relay { id, stop }) {
            let _ = previous.stop.send(None);
        }
        (id, stopped)
    }

    /// Remove a relay, returning how many remain
    pub async fn deregister_relay(&self, name: &str, id: u64) -> usize {
        let mut relays = self.relays.lock().await;
        if relays.get(name).is_some_and(|r| r.id == id) {
            relays.remove(name);
        }
        relays.len()
    }

    /// Stop every relay, pointing followers at `newleader`
    pub async fn stop_relays(&self, newleader: Option<String>) -> usize {
        let relays = std::mem::take(&mut *self.relays.lock().await);
        let count = relays.len();
        for relay in relays.into_values() {
            let _ = relay.stop.send(newleader.clone());
        }
        count
    }

    /// Names of members currently following us
    pub async fn relay_names(&self) -> Vec<String> {
        self.relays.lock().await.keys().cloned().collect()
    }

    pub async fn relay_count(&self) -> usize {
        self.relays.lock().await.len()
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_tracks_holder() {
        let gate = Gate::new("test");
        assert!(!gate.is_active());
        {
            let _guard = gate.enter().await;
            assert!(gate.is_active());
        }
        assert!(!gate.is_active());
    }

    #[tokio::test]
    async fn test_gate_serializes_holders() {
        let state = Arc::new(ClusterState::new());
        let guard = state.connecting.enter().await;

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let _guard = state.connecting.enter().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(!state.connecting.is_active());
    }

    #[tokio::test]
    async fn test_follower_release_only_clears_own_slot() {
        let state = ClusterState::new();
        state
            .spawn_follower("10.0.0.1", |_| std::future::pending::<()>())
            .await;
        assert!(state.has_follower().await);

        assert!(!state.release_follower(9999).await);
        assert!(state.has_follower().await);

        assert_eq!(state.take_follower().await.as_deref(), Some("10.0.0.1"));
        assert!(!state.has_follower().await);
    }

    #[tokio::test]
    async fn test_relays_are_stopped_with_new_leader() {
        let state = ClusterState::new();
        let (_, stop_a) = state.register_relay("mgt2").await;
        let (_, stop_b) = state.register_relay("mgt3").await;
        assert_eq!(state.relay_names().await, vec!["mgt2", "mgt3"]);

        assert_eq!(state.stop_relays(Some("10.0.0.9".into())).await, 2);
        assert_eq!(stop_a.await.unwrap().as_deref(), Some("10.0.0.9"));
        assert_eq!(stop_b.await.unwrap().as_deref(), Some("10.0.0.9"));
        assert_eq!(state.relay_count().await, 0);
    }

    #[tokio::test]
    async fn test_reconnecting_member_displaces_old_relay() {
        let state = ClusterState::new();
        let (old_id, old_stop) = state.register_relay("mgt2").await;
        let (new_id, _new_stop) = state.register_relay("mgt2").await;

        assert_eq!(old_stop.await.unwrap(), None);
        assert_eq!(state.deregister_relay("mgt2", old_id).await, 1);
        assert_eq!(state.deregister_relay("mgt2", new_id).await, 0);
    }
}
