//! Self-certifying public identities.
//!
//! An identity string is `base58(public_key ‖ checksum)` where `public_key` is
//! a 32-byte X25519 key and `checksum` is the first byte of
//! `SHA-256(public_key)`. Validity is a pure function of the string: anyone can
//! derive the public key from it without consulting a directory.

use std::fmt;

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Byte length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

const CHECKSUM_LEN: usize = 1;
const DECODED_LEN: usize = PUBLIC_KEY_LEN + CHECKSUM_LEN;

/// Reasons an identity string fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,

    #[error("identity is not valid base58: {0}")]
    Encoding(String),

    #[error("identity decodes to {0} bytes, expected {DECODED_LEN}")]
    Length(usize),

    #[error("identity checksum mismatch")]
    Checksum,

    #[error("identity is a low-order point")]
    LowOrder,

    #[error("entropy source failed: {0}")]
    Entropy(String),
}

/// The public half of an identity, as derived from its string form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityKey(PublicKey);

impl IdentityKey {
    /// Parse and validate an identity string.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] if the string is empty, is not base58, has
    /// the wrong decoded length or a bad checksum, or names a low-order point
    /// that no key agreement could be sealed to.
    pub fn parse(identity: &str) -> Result<Self, IdentityError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(IdentityError::Empty);
        }
        let raw = bs58::decode(identity)
            .into_vec()
            .map_err(|e| IdentityError::Encoding(e.to_string()))?;
        if raw.len() != DECODED_LEN {
            return Err(IdentityError::Length(raw.len()));
        }

        let (key, checksum) = raw.split_at(PUBLIC_KEY_LEN);
        if checksum[0] != checksum_byte(key) {
            return Err(IdentityError::Checksum);
        }

        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(key);
        let public = PublicKey::from(bytes);
        if !is_contributory(&public) {
            return Err(IdentityError::LowOrder);
        }
        Ok(Self(public))
    }

    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(PublicKey::from(bytes))
    }

    /// The underlying X25519 public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.0
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    /// Encode this key in its canonical identity-string form.
    pub fn to_identity_string(&self) -> String {
        let mut raw = Vec::with_capacity(DECODED_LEN);
        raw.extend_from_slice(self.as_bytes());
        raw.push(checksum_byte(self.as_bytes()));
        bs58::encode(raw).into_string()
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentityKey")
            .field(&self.to_identity_string())
            .finish()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_identity_string())
    }
}

/// A full identity key pair. Used by the server as the fixed sender and by
/// clients to open envelopes addressed to them.
#[derive(Clone)]
pub struct IdentityKeypair {
    secret: StaticSecret,
    public: IdentityKey,
}

impl IdentityKeypair {
    /// Generate a fresh key pair from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Entropy`] if the OS entropy source fails.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut seed = [0u8; PUBLIC_KEY_LEN];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| IdentityError::Entropy(e.to_string()))?;
        Ok(Self::from_secret_bytes(seed))
    }

    /// Rebuild a key pair from a 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = IdentityKey(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Public half of this key pair.
    pub fn public(&self) -> &IdentityKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret scalar.
        f.debug_struct("IdentityKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn checksum_byte(key: &[u8]) -> u8 {
    Sha256::digest(key)[0]
}

/// A clamped scalar is a multiple of the cofactor, so the product with any
/// point of small order is the identity. Every other point yields a nonzero
/// shared secret.
fn is_contributory(public: &PublicKey) -> bool {
    StaticSecret::from([0x5a; PUBLIC_KEY_LEN])
        .diffie_hellman(public)
        .was_contributory()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_parses_back() {
        let kp = IdentityKeypair::generate().unwrap();
        let id = kp.public().to_identity_string();
        let parsed = IdentityKey::parse(&id).unwrap();
        assert_eq!(&parsed, kp.public());
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let kp = IdentityKeypair::generate().unwrap();
        let id = format!("  {}\t", kp.public());
        assert!(IdentityKey::parse(&id).is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(IdentityKey::parse(""), Err(IdentityError::Empty));
        assert_eq!(IdentityKey::parse("   "), Err(IdentityError::Empty));
    }

    #[test]
    fn rejects_non_base58() {
        // '0', 'O', 'I' and 'l' are outside the base58 alphabet.
        assert!(matches!(
            IdentityKey::parse("0OIl"),
            Err(IdentityError::Encoding(_))
        ));
    }

    #[test]
    fn rejects_low_order_points_with_valid_checksum() {
        let mut one = [0u8; PUBLIC_KEY_LEN];
        one[0] = 1;
        for bytes in [[0u8; PUBLIC_KEY_LEN], one] {
            let id = IdentityKey::from_bytes(bytes).to_identity_string();
            assert_eq!(IdentityKey::parse(&id), Err(IdentityError::LowOrder));
        }
    }

    #[test]
    fn rejects_wrong_length() {
        let short = bs58::encode([7u8; 16]).into_string();
        assert_eq!(IdentityKey::parse(&short), Err(IdentityError::Length(16)));
    }

    #[test]
    fn rejects_bad_checksum() {
        let kp = IdentityKeypair::generate().unwrap();
        let mut raw = kp.public().as_bytes().to_vec();
        raw.push(checksum_byte(kp.public().as_bytes()).wrapping_add(1));
        let tampered = bs58::encode(raw).into_string();
        assert_eq!(IdentityKey::parse(&tampered), Err(IdentityError::Checksum));
    }

    #[test]
    fn keypair_is_deterministic_from_secret() {
        let a = IdentityKeypair::from_secret_bytes([9u8; 32]);
        let b = IdentityKeypair::from_secret_bytes([9u8; 32]);
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn keypair_debug_is_redacted() {
        let kp = IdentityKeypair::from_secret_bytes([1u8; 32]);
        assert!(format!("{kp:?}").contains("REDACTED"));
    }
}
