//! Replication Module
//!
//! Snapshot transfer and transaction streaming between leader and followers.

pub mod follower;
pub mod leader;
pub mod protocol;

pub use follower::{follow_stream, receive_snapshot, FollowEnd};
pub use leader::{relay_transactions, transmit_snapshot, RelayEnd};
pub use protocol::{CollectiveInfo, ErrorReply, FrameHeader, Message, Request};
