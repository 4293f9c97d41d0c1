//! Identity validation and token sealing, behind the [`IdentityCrypto`] seam.
//!
//! Handlers depend on the trait, not on a primitive. Any implementation must
//! guarantee that a ciphertext produced for `(plaintext, recipient)` can only
//! be opened with the recipient's private key, and that the opener can
//! authenticate the sender.

use common::{
    envelope::{self, EnvelopeError},
    identity::IdentityError,
    IdentityKey, IdentityKeypair,
};

/// Capability: derive keys from identity strings and seal payloads to them.
#[cfg_attr(test, mockall::automock)]
pub trait IdentityCrypto: Send + Sync {
    /// Validate a claimed identity and derive its public key.
    fn validate(&self, identity: &str) -> Result<IdentityKey, IdentityError>;

    /// Seal `plaintext` under `label` from `sender` to `recipient`.
    fn encrypt(
        &self,
        label: &str,
        plaintext: &[u8],
        sender: &IdentityKeypair,
        recipient: &IdentityKey,
    ) -> Result<Vec<u8>, EnvelopeError>;
}

/// X25519 + AES-256-GCM-SIV sealed envelopes from [`common::envelope`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SealedBoxCrypto;

impl IdentityCrypto for SealedBoxCrypto {
    fn validate(&self, identity: &str) -> Result<IdentityKey, IdentityError> {
        IdentityKey::parse(identity)
    }

    fn encrypt(
        &self,
        label: &str,
        plaintext: &[u8],
        sender: &IdentityKeypair,
        recipient: &IdentityKey,
    ) -> Result<Vec<u8>, EnvelopeError> {
        envelope::seal(label, plaintext, sender, recipient)
    }
}
