//! WolfCollective Error Types

use thiserror::Error;

/// Result type alias for collective operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCollective error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    // Protocol violations
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported protocol version '{0}', synchronize versions between collective members")]
    UnsupportedVersion(String),

    #[error("Redirected to self by {0}")]
    RedirectedToSelf(String),

    #[error("Gave up after {0} leader redirects")]
    TooManyRedirects(usize),

    #[error("Unrecognized operation: {0}")]
    UnknownOperation(String),

    // Trust failures
    #[error("Certificate mismatch in the collective for {0}")]
    CertificateMismatch(String),

    #[error("Unrecognized collective member: {0}")]
    UnknownMember(String),

    #[error("Invalid invitation: {0}")]
    InvalidInvitation(String),

    #[error("Invalid proof from {0}")]
    InvalidProof(String),

    // Collective state
    #[error("Collective does not have quorum")]
    DegradedCollective,

    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Collective mode not enabled on this system")]
    NotInCollective,

    #[error("{0} is still active, stop the service on it before removing it")]
    MemberActive(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration is read-only while following the collective leader")]
    ReadOnly,

    #[error("Snapshot restore failed: {0}")]
    SnapshotRestore(String),

    // Serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient connectivity failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Io(_)
        )
    }

    /// Check if this error must be treated as a security event
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Error::CertificateMismatch(_)
                | Error::UnknownMember(_)
                | Error::InvalidInvitation(_)
                | Error::InvalidProof(_)
        )
    }

    /// Check if this error means the collective lacks quorum
    pub fn is_degraded(&self) -> bool {
        matches!(self, Error::DegradedCollective)
    }
}
