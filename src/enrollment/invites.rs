//! Invitations
//!
//! An invitation is a one-time secret bound to a member name. Both sides of
//! the enrollment prove knowledge of it by signing the pair of certificates
//! seen on the connection, in opposite orders.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const SECRET_LEN: usize = 48;

/// Invitations issued by this member and not yet used
#[derive(Default)]
pub struct InvitationRegistry {
    pending: Mutex<HashMap<String, Vec<u8>>>,
}

impl InvitationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue an invitation for `name`, replacing any earlier one
    pub async fn create(&self, name: &str) -> Result<String> {
        if name.is_empty() || name.contains('@') {
            return Err(Error::InvalidInvitation(format!("invalid member name '{}'", name)));
        }

        let mut secret = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        self.pending.lock().await.insert(name.to_string(), secret.clone());

        let mut token = name.as_bytes().to_vec();
        token.push(b'@');
        token.extend_from_slice(&secret);
        Ok(BASE64.encode(token))
    }

    /// Check the joiner's proof; on success the invitation is consumed and
    /// the counter-proof to send back is returned
    pub async fn redeem(
        &self,
        name: &str,
        my_certificate: &[u8],
        peer_certificate: &[u8],
        proof: &[u8],
    ) -> Result<Vec<u8>> {
        let mut pending = self.pending.lock().await;
        let secret = pending
            .get(name)
            .ok_or_else(|| Error::InvalidInvitation(format!("no invitation pending for {}", name)))?;

        // The joiner signs (our certificate, its certificate)
        let mut mac = keyed(secret)?;
        mac.update(my_certificate);
        mac.update(peer_certificate);
        mac.verify_slice(proof)
            .map_err(|_| Error::InvalidProof(name.to_string()))?;

        let counter = sign(secret, peer_certificate, my_certificate)?;
        pending.remove(name);
        Ok(counter)
    }
}

/// Split an invitation token into the member name and secret
pub fn decode_invitation(token: &str) -> Result<(String, Vec<u8>)> {
    let raw = BASE64
        .decode(token.trim())
        .map_err(|_| Error::InvalidInvitation("invalid token format".into()))?;
    let at = raw
        .iter()
        .position(|b| *b == b'@')
        .ok_or_else(|| Error::InvalidInvitation("invalid token format".into()))?;

    let name = std::str::from_utf8(&raw[..at])
        .map_err(|_| Error::InvalidInvitation("invalid member name in token".into()))?;
    if name.is_empty() {
        return Err(Error::InvalidInvitation("invalid member name in token".into()));
    }
    Ok((name.to_string(), raw[at + 1..].to_vec()))
}

/// Joiner's proof: signs (server certificate, own certificate)
pub fn client_proof(secret: &[u8], my_certificate: &[u8], server_certificate: &[u8]) -> Result<Vec<u8>> {
    sign(secret, server_certificate, my_certificate)
}

/// Check the inviter's counter-proof: signs (joiner certificate, server certificate)
pub fn check_server_proof(
    secret: &[u8],
    my_certificate: &[u8],
    server_certificate: &[u8],
    proof: &[u8],
) -> Result<()> {
    let mut mac = keyed(secret)?;
    mac.update(my_certificate);
    mac.update(server_certificate);
    mac.verify_slice(proof)
        .map_err(|_| Error::InvalidProof("collective leader".into()))
}

fn keyed(secret: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret)
        .map_err(|_| Error::InvalidInvitation("unusable invitation secret".into()))
}

fn sign(secret: &[u8], first: &[u8], second: &[u8]) -> Result<Vec<u8>> {
    let mut mac = keyed(secret)?;
    mac.update(first);
    mac.update(second);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &[u8] = b"server-certificate";
    const CLIENT: &[u8] = b"client-certificate";

    #[tokio::test]
    async fn test_full_handshake() {
        let registry = InvitationRegistry::new();
        let token = registry.create("mgt2").await.unwrap();

        let (name, secret) = decode_invitation(&token).unwrap();
        assert_eq!(name, "mgt2");

        let proof = client_proof(&secret, CLIENT, SERVER).unwrap();
        let counter = registry.redeem("mgt2", SERVER, CLIENT, &proof).await.unwrap();
        check_server_proof(&secret, CLIENT, SERVER, &counter).unwrap();

        // Redeemed invitations are gone
        let err = registry.redeem("mgt2", SERVER, CLIENT, &proof).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInvitation(_)));
    }

    #[tokio::test]
    async fn test_invitation_is_single_use() {
        let registry = InvitationRegistry::new();
        let token = registry.create("mgt2").await.unwrap();
        let (_, secret) = decode_invitation(&token).unwrap();
        let proof = client_proof(&secret, CLIENT, SERVER).unwrap();

        registry.redeem("mgt2", SERVER, CLIENT, &proof).await.unwrap();
        let err = registry.redeem("mgt2", SERVER, CLIENT, &proof).await.unwrap_err();
        assert!(err.is_security_event());
    }

    #[tokio::test]
    async fn test_proof_is_bound_to_certificates() {
        let registry = InvitationRegistry::new();
        let token = registry.create("mgt2").await.unwrap();
        let (_, secret) = decode_invitation(&token).unwrap();

        // A proof made for a different server certificate (a man in the middle)
        let proof = client_proof(&secret, CLIENT, b"intercepting-certificate").unwrap();
        let err = registry.redeem("mgt2", SERVER, CLIENT, &proof).await.unwrap_err();
        assert!(matches!(err, Error::InvalidProof(_)));

        // Failed attempts leave the invitation usable
        let proof = client_proof(&secret, CLIENT, SERVER).unwrap();
        assert!(registry.redeem("mgt2", SERVER, CLIENT, &proof).await.is_ok());
    }

    #[tokio::test]
    async fn test_reflected_proof_is_rejected() {
        let registry = InvitationRegistry::new();
        let token = registry.create("mgt2").await.unwrap();
        let (_, secret) = decode_invitation(&token).unwrap();
        let proof = client_proof(&secret, CLIENT, SERVER).unwrap();

        assert!(check_server_proof(&secret, CLIENT, SERVER, &proof).is_err());
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(decode_invitation("!!!not base64").is_err());
        assert!(decode_invitation(&BASE64.encode(b"no-separator")).is_err());
        assert!(decode_invitation(&BASE64.encode(b"@secret")).is_err());
    }

    #[tokio::test]
    async fn test_rejects_unusable_names() {
        let registry = InvitationRegistry::new();
        assert!(registry.create("").await.is_err());
        assert!(registry.create("a@b").await.is_err());
    }
}
