//! Follower Side Replication
//!
//! Receives the leader's snapshot and applies the transactions it relays.

use crate::error::{Error, Result};
use crate::network::PeerConnection;
use crate::replication::Message;
use crate::store::{ConfigStore, KeyMaterial, Snapshot};

/// Why a follower stream ended
#[derive(Debug)]
pub enum FollowEnd {
    /// The leader stepped down, naming who to follow next
    Exit(Option<String>),
    /// The stream broke or timed out
    Lost(Error),
}

fn unexpected(expected: &str, got: &Message) -> Error {
    Error::Protocol(format!("expected {}, got {}", expected, got.type_name()))
}

/// Receive the rest of a snapshot once the leader has sent its keys
pub async fn receive_snapshot(conn: &mut PeerConnection, keys: KeyMaterial) -> Result<Snapshot> {
    let members = match conn.recv().await? {
        Message::Members(members) => members,
        other => return Err(unexpected("member table", &other)),
    };

    let globals = match conn.recv().await? {
        Message::Globals(globals) => globals,
        other => return Err(unexpected("globals", &other)),
    };

    let (txcount, dbsize) = match conn.recv().await? {
        Message::SnapshotHeader { txcount, dbsize } => (txcount, dbsize),
        other => return Err(unexpected("snapshot header", &other)),
    };

    let size = usize::try_from(dbsize)
        .map_err(|_| Error::Protocol(format!("snapshot of {} bytes is too large", dbsize)))?;
    let data = match size {
        0 => Vec::new(),
        _ => conn.recv_payload(size).await?,
    };

    tracing::debug!(
        "Received snapshot at transaction {} ({} bytes) from {}",
        txcount,
        size,
        conn.peer_address()
    );

    Ok(Snapshot {
        keys,
        members,
        globals,
        txcount,
        data,
    })
}

/// Apply relayed transactions until the leader exits or the stream is lost
pub async fn follow_stream(conn: &mut PeerConnection, store: &dyn ConfigStore) -> FollowEnd {
    loop {
        match conn.recv().await {
            Ok(Message::Transaction(tx)) => {
                let txcount = tx.txcount;
                if let Err(e) = store.apply(tx).await {
                    tracing::error!("Failed to apply transaction {}: {}", txcount, e);
                    return FollowEnd::Lost(e);
                }
            }
            Ok(Message::Keepalive) => {}
            Ok(Message::Exit { newleader }) => return FollowEnd::Exit(newleader),
            Ok(other) => return FollowEnd::Lost(unexpected("transaction", &other)),
            Err(e) => return FollowEnd::Lost(e),
        }
    }
}
