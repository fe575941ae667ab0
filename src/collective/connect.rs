//! Following a leader
//!
//! Connecting to a leader either installs its snapshot and starts the
//! follower stream, gets redirected to the real leader, or discovers that we
//! hold more transactions and should lead instead.

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;

use super::Collective;
use crate::error::{Error, Result};
use crate::network::PeerConnection;
use crate::replication::{follow_stream, receive_snapshot, FollowEnd, Message, Request};
use crate::state::Role;
use crate::trust::Fingerprint;

/// Outcome of one connection attempt
enum Attempt {
    /// Snapshot installed, follower stream running
    Following,
    /// The target declined for now
    Declined,
    /// The target follows someone else
    Redirect(String),
    /// The target has fewer transactions than we do
    Superior(PeerConnection),
}

impl Collective {
    /// Follow the leader at `leader`, chasing redirects
    ///
    /// `pinned` checks the first hop against a known fingerprint instead of
    /// the member table (used right after enrollment). An already dialed
    /// connection may be handed in through `conn`. Returns whether we ended
    /// up following or leading.
    pub(crate) fn connect_to_leader(
        self: &Arc<Self>,
        leader: String,
        pinned: Option<Fingerprint>,
        conn: Option<PeerConnection>,
    ) -> BoxFuture<'static, bool> {
        let this = Arc::clone(self);
        async move {
            let mut target = leader;
            let mut pinned = pinned;
            let mut conn = conn;
            let mut redirects = 0usize;

            loop {
                if this.is_stopped() {
                    return false;
                }

                tracing::info!("Attempting connection to leader {}", target);
                let remote = match conn.take() {
                    Some(remote) => remote,
                    None => match this.dialer.dial(&target).await {
                        Ok(remote) => remote,
                        Err(e) => {
                            tracing::error!("Collective connection attempt to {} failed: {}", target, e);
                            return false;
                        }
                    },
                };

                let fingerprint = pinned.take();
                if let Err(e) = this.verify_peer(&target, fingerprint.as_ref(), &remote).await {
                    tracing::error!("Not following {}: {}", target, e);
                    return false;
                }

                match this.attempt_follow(&target, remote).await {
                    Ok(Attempt::Following) => return true,
                    Ok(Attempt::Declined) => return false,
                    Ok(Attempt::Redirect(next)) => {
                        redirects += 1;
                        if redirects > this.config.max_redirects {
                            tracing::error!("{}", Error::TooManyRedirects(this.config.max_redirects));
                            return false;
                        }
                        target = next;
                    }
                    Ok(Attempt::Superior(remote)) => {
                        let myself = remote.local_address().to_string();
                        let peer = remote.peer_address().to_string();
                        drop(remote);
                        this.become_leader(myself, Some(peer)).await;
                        return true;
                    }
                    Err(e) => {
                        tracing::error!("Collective connection attempt to {} failed: {}", target, e);
                        return false;
                    }
                }
            }
        }
        .boxed()
    }

    async fn attempt_follow(self: &Arc<Self>, target: &str, mut remote: PeerConnection) -> Result<Attempt> {
        let gate = self.state.connecting.enter().await;

        let myname = self.myname().await;
        let txcount = self.store.txcount().await;
        remote.set_timeout(self.config.request_timeout());
        let reply = remote
            .request(Request::Connect {
                name: myname.clone(),
                txcount,
            })
            .await?;

        let keys = match reply {
            Message::Keys(keys) => keys,
            Message::Error(reply) => {
                if reply.backoff {
                    tracing::info!("Collective initialization in progress on {}", target);
                    return Ok(Attempt::Declined);
                }
                if let Some(leader) = reply.leader {
                    if let Some(member) = self.store.member_by_address(&leader).await {
                        if member.name == myname {
                            return Err(Error::RedirectedToSelf(target.to_string()));
                        }
                    }
                    tracing::info!("Redirected from {} to leader at {}", target, leader);
                    return Ok(Attempt::Redirect(leader));
                }
                if reply.txcount.is_some() {
                    tracing::info!("Remote member {} defers to us ({}), becoming leader", target, reply.error);
                    drop(gate);
                    return Ok(Attempt::Superior(remote));
                }
                tracing::warn!("Connection to {} refused: {}", target, reply.error);
                return Ok(Attempt::Declined);
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected keys from leader, got {}",
                    other.type_name()
                )));
            }
        };

        if let Some(previous) = self.state.take_follower().await {
            tracing::debug!("Dropping stream from previous leader {}", previous);
        }
        if self.state.relay_count().await > 0 {
            self.retire_as_leader(Some(target.to_string())).await;
        }

        tracing::info!("Following leader {}", target);
        let snapshot = receive_snapshot(&mut remote, keys).await?;
        {
            let _init = self.state.leader_init.enter().await;
            self.store.restore(snapshot).await?;
            self.store.set_read_only(true).await;
        }

        self.state.set_leader(Some(target.to_string())).await;
        self.state.set_role(Role::Follower).await;
        self.state.set_initting(false);
        self.retry.cancel().await;

        remote.set_timeout(self.config.stream_idle_timeout());
        let this = Arc::clone(self);
        let leader = target.to_string();
        self.state
            .spawn_follower(target, move |id| async move {
                this.follow_leader(remote, leader, id).await;
            })
            .await;

        drop(gate);
        Ok(Attempt::Following)
    }

    /// Body of the follower task
    async fn follow_leader(self: Arc<Self>, mut remote: PeerConnection, leader: String, id: u64) {
        let end = follow_stream(&mut remote, self.store.as_ref()).await;
        drop(remote);
        self.state.release_follower(id).await;

        if self.is_stopped() {
            return;
        }

        match end {
            FollowEnd::Exit(Some(newleader)) => {
                tracing::info!("Leader {} handed off to {}", leader, newleader);
                if self.connect_to_leader(newleader, None, None).await {
                    return;
                }
            }
            FollowEnd::Exit(None) => tracing::info!("Leader {} stepped down", leader),
            FollowEnd::Lost(e) => tracing::debug!("Stream from leader {} ended: {}", leader, e),
        }

        if self.state.has_follower().await {
            return;
        }

        tracing::info!(
            "Current leader ({}) has disappeared, restarting collective membership",
            leader
        );
        self.store.set_read_only(false).await;
        self.state.set_leader(None).await;
        if self.state.role().await != Role::Leader {
            self.state.set_role(Role::Connecting).await;
        }
        self.schedule_retry(self.short_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::fixtures::{certificate, gamma, Canned, ALPHA, BETA, GAMMA};
    use crate::config::ProtocolConfig;
    use crate::network::{Dialer, MemoryNetwork};
    use crate::replication::ErrorReply;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            request_timeout_secs: 2,
            max_redirects: 3,
            retry_base_delay_ms: 10_000,
            ..ProtocolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_redirect_to_ourselves_is_refused() {
        let network = MemoryNetwork::new();
        let me = gamma(&network, config()).await;
        let alpha = Canned::new(
            ErrorReply::new("Cannot assimilate, our leader is in another castle").with_leader(Some(GAMMA.into())),
        );
        network.register(ALPHA, &certificate("alpha"), alpha.clone()).await;

        let remote = network.dialer(GAMMA, &certificate("gamma")).dial(ALPHA).await.unwrap();
        match me.attempt_follow(ALPHA, remote).await {
            Err(Error::RedirectedToSelf(target)) => assert_eq!(target, ALPHA),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("redirect to ourselves was accepted"),
        }

        assert!(!me.connect_to_leader(ALPHA.into(), None, None).await);
        assert!(!me.is_following().await);
        assert_eq!(alpha.requests(), 2);
        me.shutdown().await;
    }

    #[tokio::test]
    async fn test_redirect_chain_is_bounded() {
        let network = MemoryNetwork::new();
        let me = gamma(&network, config()).await;
        // alpha and beta each claim the other leads
        let alpha = Canned::new(ErrorReply::new("Cannot assimilate").with_leader(Some(BETA.into())));
        let beta = Canned::new(ErrorReply::new("Cannot assimilate").with_leader(Some(ALPHA.into())));
        network.register(ALPHA, &certificate("alpha"), alpha.clone()).await;
        network.register(BETA, &certificate("beta"), beta.clone()).await;

        assert!(!me.connect_to_leader(ALPHA.into(), None, None).await);
        assert_eq!(alpha.requests() + beta.requests(), me.config.max_redirects + 1);
        assert!(!me.is_following().await);
        me.shutdown().await;
    }

    #[tokio::test]
    async fn test_backoff_reply_declines() {
        let network = MemoryNetwork::new();
        let me = gamma(&network, config()).await;
        let alpha = Canned::new(ErrorReply::new("Collective initialization in progress").backoff());
        network.register(ALPHA, &certificate("alpha"), alpha.clone()).await;

        assert!(!me.connect_to_leader(ALPHA.into(), None, None).await);
        assert_eq!(alpha.requests(), 1);
        assert!(!me.is_following().await);
        assert_ne!(me.role().await, Role::Leader);
        assert!(!me.state.connecting.is_active());
        me.shutdown().await;
    }

    #[tokio::test]
    async fn test_deferring_member_makes_us_leader() {
        let network = MemoryNetwork::new();
        let me = gamma(&network, config()).await;
        let alpha = Canned::new(
            ErrorReply::new("Client has higher transaction count, should assimilate me, connecting..").with_txcount(0),
        );
        network.register(ALPHA, &certificate("alpha"), alpha.clone()).await;

        assert!(me.connect_to_leader(ALPHA.into(), None, None).await);
        assert_eq!(me.role().await, Role::Leader);
        assert_eq!(me.leader().await.as_deref(), Some(GAMMA));
        assert!(!me.store.is_read_only().await);
        me.shutdown().await;
    }

    #[tokio::test]
    async fn test_impostor_is_not_followed() {
        let network = MemoryNetwork::new();
        let me = gamma(&network, config()).await;
        let impostor = Canned::new(Message::Ack);
        network.register(ALPHA, b"impostor-certificate", impostor.clone()).await;

        assert!(!me.connect_to_leader(ALPHA.into(), None, None).await);

        // A pinned digest is checked instead of the member table
        let pinned = Fingerprint::of_certificate(b"someone-else");
        network.register(ALPHA, &certificate("alpha"), impostor.clone()).await;
        assert!(!me.connect_to_leader(ALPHA.into(), Some(pinned), None).await);

        // Nothing was sent to either
        assert_eq!(impostor.requests(), 0);
        assert!(!me.is_following().await);
        me.shutdown().await;
    }
}
