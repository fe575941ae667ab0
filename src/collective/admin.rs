//! Local administration
//!
//! Operations issued by the local administrator (through the API or the
//! control tool) rather than by other members.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::Collective;
use crate::error::{Error, Result};
use crate::replication::{CollectiveInfo, Message, Request};
use crate::state::Role;
use crate::store::TxCount;

/// Local status of this member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub name: String,
    pub role: Role,
    pub leader: Option<String>,
    pub txcount: TxCount,
    pub members: usize,
    /// Members following us (while leading)
    pub followers: Vec<String>,
    pub quorum: bool,
}

impl Collective {
    /// Collective view, fetched from the leader when following
    pub async fn show(self: &Arc<Self>) -> Result<CollectiveInfo> {
        if self.store.members().await.is_empty() {
            return Err(Error::NotInCollective);
        }

        let mut info = if self.state.has_follower().await {
            let leader = self.state.leader().await.ok_or(Error::DegradedCollective)?;
            self.leader_info(&leader).await?
        } else {
            self.collective_info().await
        };
        info.quorum = Some(self.check_quorum().await.is_ok());
        Ok(info)
    }

    async fn leader_info(&self, leader: &str) -> Result<CollectiveInfo> {
        let mut remote = self.dialer.dial(leader).await?;
        self.verify_peer(leader, None, &remote).await?;
        remote.set_timeout(self.config.request_timeout());

        let request = Request::GetInfo {
            name: self.myname().await,
        };
        match remote.request(request).await? {
            Message::Info(info) => Ok(info),
            Message::Error(reply) => Err(Error::Protocol(reply.error)),
            other => Err(Error::Protocol(format!(
                "expected collective info, got {}",
                other.type_name()
            ))),
        }
    }

    /// Remove an offline member from the collective
    pub async fn delete(self: &Arc<Self>, member: &str) -> Result<String> {
        self.check_quorum().await?;
        let info = self.show().await?;

        if info.leader == member || info.active.iter().any(|m| m == member) {
            return Err(Error::MemberActive(member.to_string()));
        }
        if !info.offline.iter().any(|m| m == member) {
            return Err(Error::UnknownMember(member.to_string()));
        }

        match self.store.remove_member(member).await {
            Ok(_) => {
                tracing::info!("Removed {} from the collective", member);
                Ok(format!("Successfully deleted {}", member))
            }
            Err(Error::ReadOnly) => Err(self.not_leader().await),
            Err(e) => Err(e),
        }
    }

    /// Snapshot of local state
    pub async fn status(&self) -> StatusReport {
        StatusReport {
            name: self.myname().await,
            role: self.state.role().await,
            leader: self.state.leader().await,
            txcount: self.store.txcount().await,
            members: self.store.members().await.len(),
            followers: self.state.relay_names().await,
            quorum: self.check_quorum().await.is_ok(),
        }
    }

    pub(crate) async fn not_leader(&self) -> Error {
        Error::NotLeader(self.state.leader().await.unwrap_or_else(|| "unknown".to_string()))
    }
}
