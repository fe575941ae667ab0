//! Startup and recovery
//!
//! On startup, and whenever the collective falls apart, members dial each
//! other in name order until they either follow someone or lead a quorum.

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use super::Collective;
use crate::network::dial_all;
use crate::state::{natural_cmp, Role};

impl Collective {
    /// Begin collective activity; a member outside a collective stays idle
    pub async fn startup(self: &Arc<Self>) {
        self.store.set_read_only(false).await;

        let members = self.store.members().await.len();
        if members < 2 {
            tracing::info!("Collective mode not active ({} members)", members);
            return;
        }

        tracing::info!("Starting collective with {} members", members);
        let round = self.start_collective();
        tokio::spawn(round);
    }

    /// Schedule a startup round unless one is already pending
    pub(crate) async fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        if self.is_stopped() {
            return;
        }
        let round = self.start_collective();
        self.retry.schedule(delay, round).await;
    }

    /// One startup round, rescheduling itself until the collective settles
    pub(crate) fn start_collective(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            if this.is_stopped() {
                return;
            }

            this.state.set_initting(true);
            this.connect_round().await;

            // Leaders keep a round pending too, so losing quorum is noticed
            if !this.state.has_follower().await {
                if this.state.role().await != Role::Leader || this.check_quorum().await.is_err() {
                    tracing::info!("Collective not yet formed, will retry");
                }
                this.schedule_retry(this.retry_delay()).await;
            }
            this.state.set_initting(false);
        }
        .boxed()
    }

    async fn connect_round(self: &Arc<Self>) {
        if self.state.has_follower().await {
            return;
        }
        if self.state.relay_count().await > 0 && self.check_quorum().await.is_ok() {
            return;
        }
        if self.state.leader_init.is_active() {
            return;
        }

        if self.state.role().await != Role::Leader {
            self.state.set_role(Role::Connecting).await;
        }

        let myname = self.myname().await;
        let mut peers: Vec<_> = self
            .store
            .members()
            .await
            .into_values()
            .filter(|m| m.name != myname)
            .collect();
        peers.sort_by(|a, b| natural_cmp(&a.name, &b.name));
        let addresses = peers.into_iter().map(|m| m.address).collect();

        let mut dials = dial_all(
            Arc::clone(&self.dialer),
            addresses,
            self.config.max_concurrent_dials,
        );
        while let Some((address, result)) = dials.next().await {
            if self.is_stopped() || self.state.has_follower().await {
                break;
            }
            if self.state.role().await == Role::Leader && self.check_quorum().await.is_ok() {
                break;
            }

            match result {
                Ok(remote) => {
                    tracing::info!("Performing startup attempt to {}", address);
                    self.connect_to_leader(address, None, Some(remote)).await;
                }
                Err(e) => tracing::debug!("Startup attempt to {} failed: {}", address, e),
            }
        }
    }
}
