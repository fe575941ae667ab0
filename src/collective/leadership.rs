//! Leading the collective
//!
//! Taking and giving up leadership, pulling members that are not following
//! us into the collective, and rebalancing managed nodes away from members
//! that went offline.

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use std::sync::Arc;

use super::Collective;
use crate::network::{dial_all, PeerConnection};
use crate::rebalance::plan_rebalance;
use crate::replication::{Message, Request};
use crate::state::Role;
use crate::store::COLLECTIVE_UUID;

impl Collective {
    /// Leader as seen by the member on the other end of `conn`
    ///
    /// With no leader, or when the leader itself is asking, we take over.
    pub(crate) async fn get_leader(self: &Arc<Self>, conn: &PeerConnection) -> Option<String> {
        let current = self.state.leader().await;
        let take_over = match current.as_deref() {
            None => true,
            Some(leader) => leader == conn.peer_address(),
        };

        if take_over {
            tracing::info!(
                "Assuming leadership in response to connection from {}",
                conn.peer_address()
            );
            self.become_leader(
                conn.local_address().to_string(),
                Some(conn.peer_address().to_string()),
            )
            .await;
        }
        self.state.leader().await
    }

    /// Take over leadership; `skip` is left out of the assimilation sweep
    pub(crate) async fn become_leader(self: &Arc<Self>, myself: String, skip: Option<String>) {
        tracing::info!("Becoming leader of collective as {}", myself);
        if let Some(previous) = self.state.take_follower().await {
            tracing::debug!("Dropping stream from previous leader {}", previous);
        }
        self.store.set_read_only(false).await;
        self.retry.cancel().await;
        self.state.set_leader(Some(myself)).await;
        self.state.set_role(Role::Leader).await;
        self.ensure_collective_uuid().await;

        if self.assimilate_missing(skip).await {
            self.schedule_rebalance().await;
            self.schedule_reassimilate().await;
        }
    }

    /// Stop leading, directing our followers to `newleader`
    pub(crate) async fn retire_as_leader(&self, newleader: Option<String>) {
        let released = self.state.stop_relays(newleader.clone()).await;
        match &newleader {
            Some(leader) => tracing::info!("Retiring as leader, {} followers sent to {}", released, leader),
            None => tracing::info!("Retiring as leader, {} followers released", released),
        }
        self.state.set_leader(None).await;
        self.state.set_role(Role::Connecting).await;
    }

    async fn ensure_collective_uuid(&self) {
        if self.store.global(COLLECTIVE_UUID).await.is_some() {
            return;
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        match self.store.set_global(COLLECTIVE_UUID, &uuid).await {
            Ok(_) => tracing::info!("Assigned collective identity {}", uuid),
            Err(e) => tracing::warn!("Failed to record collective identity: {}", e),
        }
    }

    /// Ask every member that is not following us to join
    ///
    /// Returns false if we deferred to a better leader along the way.
    pub(crate) async fn assimilate_missing(self: &Arc<Self>, skip: Option<String>) -> bool {
        let myname = self.myname().await;
        let followers = self.state.relay_names().await;
        let leader = self.state.leader().await;

        let addresses: Vec<String> = self
            .store
            .members()
            .await
            .into_values()
            .filter(|m| m.name != myname && !followers.contains(&m.name))
            .filter(|m| Some(&m.address) != skip.as_ref() && Some(&m.address) != leader.as_ref())
            .map(|m| m.address)
            .collect();
        if addresses.is_empty() {
            return true;
        }

        let mut dials = dial_all(
            Arc::clone(&self.dialer),
            addresses,
            self.config.max_concurrent_dials,
        );
        while let Some((address, result)) = dials.next().await {
            match result {
                Ok(remote) => {
                    if !self.try_assimilate(&address, followers.len(), remote).await {
                        return false;
                    }
                }
                Err(e) => tracing::debug!("Unable to reach {} for assimilation: {}", address, e),
            }
        }
        true
    }

    async fn try_assimilate(self: &Arc<Self>, address: &str, followcount: usize, mut remote: PeerConnection) -> bool {
        if let Err(e) = self.verify_peer(address, None, &remote).await {
            tracing::warn!("Not assimilating {}: {}", address, e);
            return true;
        }

        let request = Request::Assimilate {
            name: self.myname().await,
            txcount: self.store.txcount().await,
            followcount: Some(followcount),
        };
        remote.set_timeout(self.config.request_timeout());
        let reply = match remote.request(request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("No answer from {} while trying to assimilate: {}", address, e);
                return true;
            }
        };
        drop(remote);

        match reply {
            Message::Error(reply) if reply.txcount.is_some() => {
                tracing::info!("Deferring to {} due to target being a better leader", address);
                self.retire_as_leader(Some(address.to_string())).await;
                if !self.connect_to_leader(address.to_string(), None, None).await {
                    self.schedule_retry(self.short_delay()).await;
                }
                false
            }
            // Already following someone; their leader will sort it out
            Message::Error(reply) if reply.leader.is_some() => true,
            Message::Error(reply) => {
                tracing::error!("Error encountered while attempting to assimilate {}: {}", address, reply.error);
                true
            }
            _ => {
                tracing::info!("Assimilated {} into collective", address);
                true
            }
        }
    }

    pub(crate) async fn schedule_rebalance(self: &Arc<Self>) {
        let task = Arc::clone(self).check_managers();
        self.rebalance.schedule(self.config.rebalance_delay(), task).await;
    }

    /// Restart the sweep timer; a fired sweep is no longer in the slot
    pub(crate) async fn schedule_reassimilate(self: &Arc<Self>) {
        let task = Arc::clone(self).reassimilate_missing();
        self.reassimilate
            .replace(self.config.reassimilate_interval(), task)
            .await;
    }

    /// Periodic sweep while leading
    fn reassimilate_missing(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.is_stopped() || self.state.relay_count().await == 0 {
                return;
            }
            if self.assimilate_missing(None).await && self.state.relay_count().await > 0 {
                self.schedule_reassimilate().await;
            }
        }
        .boxed()
    }

    /// Hand nodes of offline managers to live candidates
    fn check_managers(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.is_stopped() || self.state.has_follower().await {
                return;
            }
            if let Err(e) = self.check_quorum().await {
                tracing::debug!("Skipping manager rebalance: {}", e);
                return;
            }

            let info = self.collective_info().await;
            match plan_rebalance(self.inventory.as_ref(), &info).await {
                Ok(plan) => {
                    for assignment in plan {
                        tracing::info!(
                            "Reassigning {} from offline manager {} to {}",
                            assignment.node,
                            assignment.from,
                            assignment.to
                        );
                        if let Err(e) = self
                            .inventory
                            .assign_manager(&assignment.node, &assignment.to)
                            .await
                        {
                            tracing::warn!("Failed to reassign {}: {}", assignment.node, e);
                        }
                    }
                }
                Err(e) => tracing::warn!("Manager rebalance failed: {}", e),
            }

            self.assimilate_missing(None).await;
        }
        .boxed()
    }
}
