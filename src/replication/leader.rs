//! Leader Side Replication
//!
//! Sends a new follower the full store, then relays every later
//! transaction until the follower goes away or the leader steps down.

use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant};

use crate::error::{Error, Result};
use crate::network::PeerConnection;
use crate::replication::Message;
use crate::state::RelayStop;
use crate::store::{Snapshot, Transaction, TxCount};

/// Why a relay ended
#[derive(Debug)]
pub enum RelayEnd {
    /// The follower closed its stream
    Disconnected,
    /// We stopped the relay (retiring, or the member reconnected)
    Stopped,
    /// The follower fell too far behind the transaction feed
    Lagged(u64),
    /// Writing to the follower failed
    Failed(Error),
}

/// Send keys, member table, globals, then the raw key/value table
pub async fn transmit_snapshot(conn: &mut PeerConnection, snapshot: &Snapshot) -> Result<()> {
    conn.send(&Message::Keys(snapshot.keys.clone())).await?;
    conn.send(&Message::Members(snapshot.members.clone())).await?;
    conn.send(&Message::Globals(snapshot.globals.clone())).await?;
    conn.send(&Message::SnapshotHeader {
        txcount: snapshot.txcount,
        dbsize: snapshot.data.len() as u64,
    })
    .await?;
    conn.send_payload(&snapshot.data).await?;

    tracing::debug!(
        "Sent snapshot at transaction {} ({} bytes) to {}",
        snapshot.txcount,
        snapshot.data.len(),
        conn.peer_address()
    );
    Ok(())
}

/// Relay committed transactions newer than `after` to a follower
///
/// `feed` must have been subscribed before the snapshot was exported so that
/// nothing committed in between is lost.
pub async fn relay_transactions(
    conn: &mut PeerConnection,
    mut feed: broadcast::Receiver<Transaction>,
    after: TxCount,
    mut stop: RelayStop,
    keepalive: Duration,
) -> RelayEnd {
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            _ = conn.closed() => return RelayEnd::Disconnected,
            stopped = &mut stop => {
                let newleader = stopped.unwrap_or(None);
                if let Err(e) = conn.send(&Message::Exit { newleader }).await {
                    tracing::debug!("Failed to notify {} of exit: {}", conn.peer_address(), e);
                }
                return RelayEnd::Stopped;
            }
            received = feed.recv() => match received {
                Ok(tx) if tx.txcount <= after => continue,
                Ok(tx) => {
                    if let Err(e) = conn.send(&Message::Transaction(tx)).await {
                        return RelayEnd::Failed(e);
                    }
                    ticker.reset();
                }
                Err(RecvError::Lagged(missed)) => return RelayEnd::Lagged(missed),
                Err(RecvError::Closed) => return RelayEnd::Disconnected,
            },
            _ = ticker.tick() => {
                if let Err(e) = conn.send(&Message::Keepalive).await {
                    return RelayEnd::Failed(e);
                }
            }
        }
    }
}
