//! Enrollment
//!
//! Adding a member to the collective: the leader issues a one-time
//! invitation, the new member presents proof of it over a TLS session and
//! both sides pin each other's certificate fingerprint.

mod invites;

pub use invites::{check_server_proof, client_proof, decode_invitation, InvitationRegistry};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;

use crate::collective::Collective;
use crate::error::{Error, Result};
use crate::network::PeerConnection;
use crate::replication::{ErrorReply, Message, Request};
use crate::store::Member;
use crate::trust::Fingerprint;

impl Collective {
    /// Issue an invitation token for a new member called `name`
    pub async fn invite(self: &Arc<Self>, name: &str) -> Result<String> {
        self.check_quorum().await?;
        if self.state.has_follower().await {
            return Err(self.not_leader().await);
        }

        let token = self.invites.create(name).await?;
        tracing::info!("Issued invitation for {}", name);
        Ok(token)
    }

    /// Join the collective at `server` using an invitation token
    pub async fn join(self: &Arc<Self>, invitation: &str, server: &str) -> Result<String> {
        let (name, secret) = decode_invitation(invitation)?;

        let mut remote = self.dialer.dial(server).await?;
        remote.set_timeout(self.config.request_timeout());
        let server_certificate = remote
            .peer_certificate()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::CertificateMismatch(server.to_string()))?;

        let proof = client_proof(&secret, &self.identity.certificate, &server_certificate)?;
        let request = Request::Enroll {
            name: name.clone(),
            hmac: BASE64.encode(proof),
        };

        let (approval, fingerprint, leader) = match remote.request(request).await? {
            Message::Enrolled {
                approval,
                fingerprint,
                leader,
            } => (approval, fingerprint, leader),
            Message::Error(reply) => return Err(Error::InvalidInvitation(reply.error)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected enrollment approval, got {}",
                    other.type_name()
                )));
            }
        };
        drop(remote);

        let approval = BASE64
            .decode(approval)
            .map_err(|_| Error::InvalidProof(server.to_string()))?;
        check_server_proof(&secret, &self.identity.certificate, &server_certificate, &approval)?;

        self.name.set(&name).await?;
        self.state.set_leader(Some(leader.clone())).await;
        tracing::info!("Enrolled as {} through {}, following leader {}", name, server, leader);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !this.connect_to_leader(leader.clone(), Some(fingerprint), None).await {
                tracing::error!("Unable to reach collective leader {} after enrollment", leader);
            }
        });

        Ok("Success".to_string())
    }

    /// A new member presents its invitation proof
    pub(crate) async fn handle_enroll(self: &Arc<Self>, mut conn: PeerConnection, name: String, hmac: String) -> Result<()> {
        let peer_certificate = conn
            .peer_certificate()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::CertificateMismatch(conn.peer_address().to_string()))?;

        let proof = match BASE64.decode(hmac.as_bytes()) {
            Ok(proof) => proof,
            Err(_) => {
                conn.send(&ErrorReply::new("Invalid token").into()).await?;
                return Err(Error::InvalidProof(name));
            }
        };
        let counter = match self
            .invites
            .redeem(&name, &self.identity.certificate, &peer_certificate, &proof)
            .await
        {
            Ok(counter) => counter,
            Err(e) => {
                conn.send(&ErrorReply::new("Invalid token").into()).await?;
                return Err(e);
            }
        };

        // First enrollment turns a standalone member into a collective
        if self.store.members().await.is_empty() {
            self.state.set_initting(false);
        }

        if let Err(e) = self.record_enrollment(&conn, &name, &peer_certificate).await {
            conn.send(&ErrorReply::new(format!("Unable to enroll {}: {}", name, e)).into())
                .await?;
            return Err(e);
        }

        let Some(leader) = self.get_leader(&conn).await else {
            conn.send(&ErrorReply::new("No collective leader available").into()).await?;
            return Err(Error::DegradedCollective);
        };
        let fingerprint = match self.store.member_by_address(&leader).await {
            Some(member) => member.fingerprint,
            None => self.identity.fingerprint.clone(),
        };

        tracing::info!("Enrolled {} into the collective", name);
        conn.send(&Message::Enrolled {
            approval: BASE64.encode(counter),
            fingerprint,
            leader,
        })
        .await
    }

    async fn record_enrollment(&self, conn: &PeerConnection, name: &str, certificate: &[u8]) -> Result<()> {
        let myname = self.myname().await;
        let me = Member::new(&myname, conn.local_address(), self.identity.fingerprint.clone());
        let recorded = self.store.member(&myname).await;
        if recorded.as_ref().map(|m| (&m.address, &m.fingerprint)) != Some((&me.address, &me.fingerprint)) {
            self.store.add_member(me).await?;
        }

        let joiner = Member::new(name, conn.peer_address(), Fingerprint::of_certificate(certificate));
        self.store.add_member(joiner).await?;
        Ok(())
    }
}
