//! Serving peers
//!
//! Dispatches requests arriving on accepted sessions: followers connecting
//! to us, leaders trying to assimilate us, info queries and enrollments.

use std::cmp::Ordering;
use std::sync::Arc;

use super::Collective;
use crate::error::{Error, Result};
use crate::network::PeerConnection;
use crate::replication::{relay_transactions, transmit_snapshot, ErrorReply, Message, RelayEnd, Request};
use crate::state::{judge_assimilation, natural_cmp, AssimilationView, Role, Verdict};
use crate::store::TxCount;
use crate::trust::TrustVerifier;

impl Collective {
    /// Serve one accepted session
    pub async fn handle_connection(self: &Arc<Self>, mut conn: PeerConnection) {
        if self.is_stopped() {
            return;
        }

        conn.set_timeout(self.config.request_timeout());
        if let Err(e) = conn.greet().await {
            tracing::debug!("Failed to greet {}: {}", conn.peer_address(), e);
            return;
        }

        let request = match conn.recv().await {
            Ok(Message::Request(request)) => request,
            Ok(other) => {
                let reply = ErrorReply::new(format!("Unrecognized operation: {}", other.type_name()));
                let _ = conn.send(&reply.into()).await;
                return;
            }
            Err(Error::Serialization(e)) => {
                tracing::debug!("Undecodable request from {}: {}", conn.peer_address(), e);
                let _ = conn.send(&ErrorReply::new("Unrecognized operation").into()).await;
                return;
            }
            Err(e) => {
                tracing::debug!("No request from {}: {}", conn.peer_address(), e);
                return;
            }
        };

        let peer = conn.peer_address().to_string();
        let operation = request.operation();
        tracing::debug!("Received {} request from {}", operation, peer);

        if request.is_local_only() {
            tracing::warn!("Rejected {} request from {}: local administrator only", operation, peer);
            let reply = ErrorReply::new(format!("{} is only available to the local administrator", operation));
            let _ = conn.send(&reply.into()).await;
            return;
        }

        let result = match request {
            Request::Connect { name, txcount } => self.handle_connect(conn, name, txcount).await,
            Request::Assimilate {
                name,
                txcount,
                followcount,
            } => self.handle_assimilate(conn, name, txcount, followcount).await,
            Request::GetInfo { name } => self.handle_getinfo(conn, name).await,
            Request::Enroll { name, hmac } => self.handle_enroll(conn, name, hmac).await,
            // Turned away above
            Request::Show | Request::Invite { .. } | Request::Join { .. } | Request::Delete { .. } => Ok(()),
        };

        if let Err(e) = result {
            if e.is_security_event() {
                tracing::warn!("Rejected {} request from {}: {}", operation, peer, e);
            } else {
                tracing::debug!("{} request from {} failed: {}", operation, peer, e);
            }
        }
    }

    /// A member wants to follow us
    async fn handle_connect(self: &Arc<Self>, mut conn: PeerConnection, name: String, txcount: TxCount) -> Result<()> {
        let verifier = TrustVerifier::new(self.store.as_ref());
        if let Err(e) = verifier.verify_member(&name, conn.peer_certificate()).await {
            conn.send(&ErrorReply::new("Invalid certificate, redo invitation process").into())
                .await?;
            return Err(e);
        }

        if self.state.connecting.is_active() || self.state.is_initting() {
            conn.send(&ErrorReply::new("Collective initialization in progress").backoff().into())
                .await?;
            return Ok(());
        }

        let myself = conn.local_address().to_string();
        let leader = self.get_leader(&conn).await;
        if leader.as_deref() != Some(myself.as_str()) {
            let reply = ErrorReply::new("Cannot assimilate, our leader is in another castle").with_leader(leader);
            conn.send(&reply.into()).await?;
            return Ok(());
        }

        let mytxcount = self.store.txcount().await;
        let myname = self.myname().await;
        // Equal data and nobody following us yet: the naturally smaller name leads
        let outranked = txcount == mytxcount
            && self.state.relay_count().await == 0
            && natural_cmp(&name, &myname) == Ordering::Less;
        if txcount > mytxcount || outranked {
            self.retire_as_leader(None).await;
            let message = if outranked {
                "Client outranks us by name, should assimilate me, connecting.."
            } else {
                "Client has higher transaction count, should assimilate me, connecting.."
            };
            conn.send(&ErrorReply::new(message).with_txcount(mytxcount).into()).await?;

            if outranked {
                tracing::info!("{} outranks us at equal transaction count, following it", name);
            } else {
                tracing::info!("{} has higher transaction count, following it", name);
            }
            let peer = conn.peer_address().to_string();
            conn.shutdown().await;
            if !self.connect_to_leader(peer, None, None).await {
                self.schedule_retry(self.retry_delay()).await;
            }
            return Ok(());
        }

        self.retry.cancel().await;
        self.serve_follower(conn, name).await
    }

    /// Send the snapshot and relay transactions until the follower goes away
    async fn serve_follower(self: &Arc<Self>, mut conn: PeerConnection, name: String) -> Result<()> {
        let peer = conn.peer_address().to_string();

        let (relay_id, stop, feed, after) = {
            let _init = self.state.leader_init.enter().await;
            if let Err(e) = self.store.update_member_address(&name, &peer).await {
                tracing::warn!("Failed to record address {} for {}: {}", peer, name, e);
            }

            let feed = self.store.subscribe();
            let snapshot = self.store.export().await?;
            let (relay_id, stop) = self.state.register_relay(&name).await;
            if let Err(e) = transmit_snapshot(&mut conn, &snapshot).await {
                self.state.deregister_relay(&name, relay_id).await;
                return Err(e);
            }
            (relay_id, stop, feed, snapshot.txcount)
        };

        tracing::info!("{} joined the collective at transaction {}", name, after);
        // With a follower in hand, keep sweeping for members still missing
        self.schedule_reassimilate().await;
        conn.set_timeout(self.config.stream_idle_timeout());
        let end = relay_transactions(&mut conn, feed, after, stop, self.config.keepalive_interval()).await;
        let remaining = self.state.deregister_relay(&name, relay_id).await;

        match &end {
            RelayEnd::Stopped => {
                tracing::debug!("Stopped relaying to {}", name);
                return Ok(());
            }
            RelayEnd::Disconnected => tracing::info!("{} left the collective", name),
            RelayEnd::Lagged(missed) => {
                tracing::warn!("{} fell behind by {} transactions, dropping it", name, missed)
            }
            RelayEnd::Failed(e) => tracing::warn!("Lost stream to {}: {}", name, e),
        }

        self.schedule_rebalance().await;
        if remaining == 0 {
            tracing::info!("All followers have disconnected, starting recovery process");
            self.schedule_retry(self.retry_delay()).await;
        }
        Ok(())
    }

    /// A leader wants us to follow it
    async fn handle_assimilate(
        self: &Arc<Self>,
        mut conn: PeerConnection,
        name: String,
        txcount: TxCount,
        followcount: Option<usize>,
    ) -> Result<()> {
        let verifier = TrustVerifier::new(self.store.as_ref());
        if let Err(e) = verifier.verify_member(&name, conn.peer_certificate()).await {
            let message = match e {
                Error::UnknownMember(_) => "Unrecognized leader, redo invitation process",
                _ => "Invalid certificate, redo invitation process",
            };
            conn.send(&ErrorReply::new(message).into()).await?;
            return Err(e);
        }

        let myname = self.myname().await;
        let mytxcount = self.store.txcount().await;
        let my_followers = self.state.relay_count().await;
        let have_quorum = self.check_quorum().await.is_ok();
        let view = AssimilationView {
            my_name: &myname,
            my_txcount: mytxcount,
            my_followers,
            leading: my_followers > 0,
            have_quorum,
            requester_name: &name,
            requester_txcount: txcount,
            requester_followers: followcount,
        };
        if let Verdict::Refuse(reason) = judge_assimilation(&view) {
            tracing::info!("Refused assimilation by {}: {}", name, reason);
            conn.send(&ErrorReply::new(reason).with_txcount(mytxcount).into()).await?;
            return Ok(());
        }

        if self.state.has_follower().await {
            let leader = self.state.leader().await;
            if leader.as_deref() == Some(conn.peer_address()) {
                return conn.send(&Message::Ack).await;
            }
            let reply = ErrorReply::new("Already following, assimilate leader first").with_leader(leader);
            conn.send(&reply.into()).await?;
            return Ok(());
        }

        if self.state.connecting.is_active() {
            conn.send(&Message::Ack).await?;
            return Ok(());
        }

        tracing::info!("Connecting in response to assimilation by {}", name);
        let newleader = conn.peer_address().to_string();
        if self.state.role().await == Role::Leader {
            self.retire_as_leader(Some(newleader.clone())).await;
        }
        conn.send(&Message::Ack).await?;
        conn.shutdown().await;

        if !self.connect_to_leader(newleader, None, None).await {
            self.schedule_retry(self.short_delay()).await;
        }
        Ok(())
    }

    /// A follower asks for the collective view
    async fn handle_getinfo(self: &Arc<Self>, mut conn: PeerConnection, name: String) -> Result<()> {
        let verifier = TrustVerifier::new(self.store.as_ref());
        if let Err(e) = verifier.verify_member(&name, conn.peer_certificate()).await {
            conn.send(&ErrorReply::new("Invalid certificate, redo invitation process").into())
                .await?;
            return Err(e);
        }

        let info = self.collective_info().await;
        conn.send(&Message::Info(info)).await
    }
}
