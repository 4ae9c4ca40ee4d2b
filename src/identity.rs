//! # Peer Identities and Signing
//!
//! - [`Identity`]: 32-byte public key identifying a peer; cheap to copy, hash and compare
//! - [`Keypair`]: the local node's Ed25519 signing key
//! - [`LocationClaim`]: what a location signature binds (content, size, expiration)
//!
//! Identities are plain values. The registry, the pending-request table and
//! the planner all key on them directly, so there is no interning and no
//! reference counting to get wrong.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::Key;

/// Domain separation prefix for location signatures.
pub const LOC_SIGNATURE_DOMAIN: &[u8] = b"korium-fs-location-v1:";

/// Purpose code a client must use for location signing requests.
pub const LOC_SIGNATURE_PURPOSE: u32 = 6;

/// Microseconds since the UNIX epoch.
#[inline]
pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Sign a location claim under [`LOC_SIGNATURE_DOMAIN`].
    pub fn sign_location(&self, claim: &LocationClaim) -> [u8; 64] {
        self.sign(&claim.signed_payload()).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

/// Content a location signature vouches for: "peer X serves file (key, query)
/// of `file_length` bytes until `expiration`".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationClaim {
    pub purpose: u32,
    /// Absolute expiration in microseconds since the UNIX epoch.
    pub expiration: u64,
    pub content_key: Key,
    pub content_query: Key,
    pub file_length: u64,
}

impl LocationClaim {
    fn signed_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(LOC_SIGNATURE_DOMAIN.len() + 4 + 8 + 32 + 32 + 8);
        payload.extend_from_slice(LOC_SIGNATURE_DOMAIN);
        payload.extend_from_slice(&self.purpose.to_be_bytes());
        payload.extend_from_slice(&self.expiration.to_be_bytes());
        payload.extend_from_slice(&self.content_key);
        payload.extend_from_slice(&self.content_query);
        payload.extend_from_slice(&self.file_length.to_be_bytes());
        payload
    }

    /// Check a signature produced by [`Keypair::sign_location`].
    pub fn verify(&self, signer: &Identity, signature: &[u8; 64]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(signer.as_bytes()) else {
            return false;
        };
        key.verify(&self.signed_payload(), &Signature::from_bytes(signature))
            .is_ok()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hex_round_trip() {
        let id = Keypair::generate().identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Identity::from_hex("abcd").is_err());
    }

    #[test]
    fn keypair_restores_from_secret() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(keypair.identity(), restored.identity());
    }

    #[test]
    fn location_signature_binds_every_field() {
        let keypair = Keypair::generate();
        let claim = LocationClaim {
            purpose: LOC_SIGNATURE_PURPOSE,
            expiration: 1_700_000_000_000_000,
            content_key: [1u8; 32],
            content_query: [2u8; 32],
            file_length: 4096,
        };
        let signature = keypair.sign_location(&claim);
        assert!(claim.verify(&keypair.identity(), &signature));

        let mut tampered = claim.clone();
        tampered.file_length += 1;
        assert!(!tampered.verify(&keypair.identity(), &signature));

        let other = Keypair::generate().identity();
        assert!(!claim.verify(&other, &signature));
    }

    #[test]
    fn display_is_short_prefix() {
        let id = Identity::from_bytes([0xab; 32]);
        assert_eq!(format!("{id}"), "abababababababab");
        assert!(format!("{id:?}").starts_with("Identity("));
    }
}
