//! Trust Verification
//!
//! Collective members use self-issued certificates. Identity is established
//! by comparing the digest of the certificate a peer presents against the
//! fingerprint pinned for it in the member table, never by a CA chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::store::{ConfigStore, Member};

/// SHA-256 digest of a DER certificate
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// Fingerprint a DER encoded certificate
    pub fn of_certificate(der: &[u8]) -> Self {
        Self(Sha256::digest(der).to_vec())
    }

    /// Check whether a presented certificate carries this fingerprint
    pub fn matches(&self, der: &[u8]) -> bool {
        Self::of_certificate(der) == *self
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256${}", hex::encode(&self.0))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Validates presented certificates against the member table
pub struct TrustVerifier<'a> {
    store: &'a dyn ConfigStore,
}

impl<'a> TrustVerifier<'a> {
    pub fn new(store: &'a dyn ConfigStore) -> Self {
        Self { store }
    }

    /// Verify the peer reached at `address` against its pinned member record
    pub async fn verify_address(&self, address: &str, presented: Option<&[u8]>) -> Result<Member> {
        let member = self
            .store
            .member_by_address(address)
            .await
            .ok_or_else(|| Error::UnknownMember(address.to_string()))?;
        Self::verify_pinned(&member.fingerprint, presented, address)?;
        Ok(member)
    }

    /// Verify a peer that identified itself by member name
    pub async fn verify_member(&self, name: &str, presented: Option<&[u8]>) -> Result<Member> {
        let member = self
            .store
            .member(name)
            .await
            .ok_or_else(|| Error::UnknownMember(name.to_string()))?;
        Self::verify_pinned(&member.fingerprint, presented, name)?;
        Ok(member)
    }

    /// Verify against an explicit digest, used before the peer is a known member
    pub fn verify_pinned(expected: &Fingerprint, presented: Option<&[u8]>, who: &str) -> Result<()> {
        match presented {
            Some(der) if expected.matches(der) => Ok(()),
            _ => {
                tracing::warn!("Certificate presented by {} does not match pinned {}", who, expected);
                Err(Error::CertificateMismatch(who.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_fingerprint_display_and_match() {
        let fp = Fingerprint::of_certificate(b"certificate bytes");
        let text = fp.to_string();
        assert!(text.starts_with("sha256$"));
        assert_eq!(text.len(), "sha256$".len() + 64);
        assert!(fp.matches(b"certificate bytes"));
        assert!(!fp.matches(b"other bytes"));
    }

    #[tokio::test]
    async fn test_verify_member_by_address() {
        let store = MemoryStore::new();
        store
            .add_member(Member::new("mgt2", "10.0.0.2", Fingerprint::of_certificate(b"mgt2-cert")))
            .await
            .unwrap();

        let verifier = TrustVerifier::new(&store);
        let member = verifier.verify_address("10.0.0.2", Some(b"mgt2-cert")).await.unwrap();
        assert_eq!(member.name, "mgt2");

        let err = verifier.verify_address("10.0.0.2", Some(b"impostor")).await.unwrap_err();
        assert!(err.is_security_event());

        let err = verifier.verify_address("10.0.0.9", Some(b"mgt2-cert")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownMember(_)));

        let err = verifier.verify_member("mgt2", None).await.unwrap_err();
        assert!(matches!(err, Error::CertificateMismatch(_)));
    }
}
