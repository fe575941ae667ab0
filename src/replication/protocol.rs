//! Collective Protocol
//!
//! Defines the records exchanged between collective members.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{GlobalTable, KeyMaterial, MemberTable, Transaction, TxCount};
use crate::trust::Fingerprint;

/// Product token opening every banner
pub const BANNER_PRODUCT: &str = "WolfCollective";

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: &str = "v3";

/// Protocol versions this build can talk to
pub const SUPPORTED_VERSIONS: &[&str] = &["v2", "v3"];

/// Largest record accepted off the wire
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Banner sent by the accepting side
pub fn banner() -> String {
    format!("{} -- {} --", BANNER_PRODUCT, PROTOCOL_VERSION)
}

/// Validate a received banner, returning the version token
pub fn check_banner(banner: &str) -> Result<&str> {
    let mut parts = banner.split_whitespace();
    let (Some(_product), Some("--"), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::Protocol(format!("malformed banner '{}'", banner)));
    };

    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(version)
    } else {
        Err(Error::UnsupportedVersion(version.to_string()))
    }
}

/// Operations a member can ask of another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ask to follow the receiver
    Connect { name: String, txcount: TxCount },

    /// Ask the receiver to follow the sender
    Assimilate {
        name: String,
        txcount: TxCount,
        /// Absent when the sender predates follower-count arbitration
        followcount: Option<usize>,
    },

    /// Ask the leader for collective membership status
    GetInfo { name: String },

    /// Complete an invitation
    Enroll { name: String, hmac: String },

    // Local-only operations
    Show,
    Invite { name: String },
    Join { invitation: String, server: String },
    Delete { member: String },
}

impl Request {
    /// Operation name (for logging)
    pub fn operation(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "connect",
            Request::Assimilate { .. } => "assimilate",
            Request::GetInfo { .. } => "getinfo",
            Request::Enroll { .. } => "enroll",
            Request::Show => "show",
            Request::Invite { .. } => "invite",
            Request::Join { .. } => "join",
            Request::Delete { .. } => "delete",
        }
    }

    /// Operations only honoured from the local administrator
    pub fn is_local_only(&self) -> bool {
        matches!(
            self,
            Request::Show | Request::Invite { .. } | Request::Join { .. } | Request::Delete { .. }
        )
    }
}

/// Error response, optionally carrying arbitration hints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
    /// Receiver is busy, try again later
    pub backoff: bool,
    /// Receiver follows this leader
    pub leader: Option<String>,
    /// Receiver holds the higher (or equal, winning) transaction count
    pub txcount: Option<TxCount>,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            backoff: false,
            leader: None,
            txcount: None,
        }
    }

    pub fn backoff(mut self) -> Self {
        self.backoff = true;
        self
    }

    pub fn with_leader(mut self, leader: Option<String>) -> Self {
        self.leader = leader;
        self
    }

    pub fn with_txcount(mut self, txcount: TxCount) -> Self {
        self.txcount = Some(txcount);
        self
    }
}

/// Membership view reported by the leader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveInfo {
    /// Name of the leader
    pub leader: String,
    /// Members currently following the leader
    pub active: Vec<String>,
    /// Members not currently following
    pub offline: Vec<String>,
    /// Whether quorum holds, as seen by the reporting member
    pub quorum: Option<bool>,
}

/// Protocol records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Session ==========
    /// Product and version banner from the accepting side
    Banner(String),

    /// Authentication outcome following the banner
    AuthStatus { passed: bool },

    /// Operation request
    Request(Request),

    /// Operation refused
    Error(ErrorReply),

    /// Operation accepted with nothing else to say
    Ack,

    // ========== Snapshot Transfer ==========
    /// Shared key material, also the acceptance of a connect
    Keys(KeyMaterial),

    /// Member table
    Members(MemberTable),

    /// Collective globals
    Globals(GlobalTable),

    /// Size of the raw key/value table that follows the record
    SnapshotHeader { txcount: TxCount, dbsize: u64 },

    // ========== Streaming ==========
    /// One committed transaction
    Transaction(Transaction),

    /// Idle stream keepalive
    Keepalive,

    /// Leader is stepping down, follow `newleader` if given
    Exit { newleader: Option<String> },

    // ========== Membership ==========
    /// Collective membership status
    Info(CollectiveInfo),

    /// Enrollment accepted, with the counter-proof and who to follow
    Enrolled {
        approval: String,
        fingerprint: Fingerprint,
        leader: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Banner(_) => "Banner",
            Message::AuthStatus { .. } => "AuthStatus",
            Message::Request(_) => "Request",
            Message::Error(_) => "Error",
            Message::Ack => "Ack",
            Message::Keys(_) => "Keys",
            Message::Members(_) => "Members",
            Message::Globals(_) => "Globals",
            Message::SnapshotHeader { .. } => "SnapshotHeader",
            Message::Transaction(_) => "Transaction",
            Message::Keepalive => "Keepalive",
            Message::Exit { .. } => "Exit",
            Message::Info(_) => "Info",
            Message::Enrolled { .. } => "Enrolled",
        }
    }
}

impl From<ErrorReply> for Message {
    fn from(reply: ErrorReply) -> Self {
        Message::Error(reply)
    }
}

/// Frame header for length-prefixed records
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
