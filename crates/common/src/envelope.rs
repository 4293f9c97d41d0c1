//! Sealed envelopes: authenticated encryption from one identity to another.
//!
//! # Format
//!
//! ```text
//! magic      4   "GWS1"
//! sender    32   sender X25519 public key
//! nonce     12   random per envelope
//! label_len  1
//! label      n   UTF-8, authenticated but not encrypted
//! sealed         AES-256-GCM-SIV(plaintext) ‖ 16-byte tag
//! ```
//!
//! The AEAD key is `HMAC-SHA256(X25519(sender, recipient), context ‖ sender ‖
//! recipient)`. Only the two parties can compute the shared secret, so a
//! successful [`open`] both recovers the plaintext and proves the envelope was
//! produced by the holder of the embedded sender key.
//!
//! Every header byte is bound as associated data; flipping any of them makes
//! [`open`] fail.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256GcmSiv, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::identity::{IdentityKey, IdentityKeypair, PUBLIC_KEY_LEN};

/// Leading bytes of every envelope.
pub const MAGIC: &[u8; 4] = b"GWS1";

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the AEAD authentication tag.
pub const TAG_LEN: usize = 16;

const KDF_CONTEXT: &[u8] = b"gateway-seal-v1";
const FIXED_HEADER_LEN: usize = MAGIC.len() + PUBLIC_KEY_LEN + NONCE_LEN + 1;

/// Errors produced by the envelope layer.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The label does not fit in the one-byte length prefix.
    #[error("label is {0} bytes, at most 255 allowed")]
    LabelTooLong(usize),

    /// The recipient key is a low-order point; the shared secret would be
    /// predictable.
    #[error("recipient key is not contributory")]
    WeakKey,

    /// The OS entropy source failed while drawing a nonce.
    #[error("entropy source failed: {0}")]
    Entropy(String),

    /// AES-GCM-SIV encryption or decryption failed.
    #[error("aead operation failed")]
    AeadFailure,

    /// The envelope bytes do not match the expected layout.
    #[error("invalid envelope format")]
    InvalidFormat,
}

/// Contents recovered by [`open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedEnvelope {
    /// Label the sender bound to the envelope.
    pub label: String,
    /// Decrypted payload.
    pub plaintext: Vec<u8>,
    /// Authenticated sender identity.
    pub sender: IdentityKey,
}

/// Seal `plaintext` under `label` from `sender` to `recipient`.
///
/// # Errors
///
/// Returns [`EnvelopeError::LabelTooLong`] for labels over 255 bytes,
/// [`EnvelopeError::WeakKey`] for low-order recipient keys, and
/// [`EnvelopeError::Entropy`] if no nonce can be drawn.
pub fn seal(
    label: &str,
    plaintext: &[u8],
    sender: &IdentityKeypair,
    recipient: &IdentityKey,
) -> Result<Vec<u8>, EnvelopeError> {
    let label_len = u8::try_from(label.len()).map_err(|_| EnvelopeError::LabelTooLong(label.len()))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| EnvelopeError::Entropy(e.to_string()))?;

    let mut out = Vec::with_capacity(FIXED_HEADER_LEN + label.len() + plaintext.len() + TAG_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(sender.public().as_bytes());
    out.extend_from_slice(&nonce);
    out.push(label_len);
    out.extend_from_slice(label.as_bytes());

    let cipher = derive_cipher(sender, recipient, sender.public(), recipient)?;
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &out,
            },
        )
        .map_err(|_| EnvelopeError::AeadFailure)?;

    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open an envelope addressed to `recipient`.
///
/// # Errors
///
/// Returns [`EnvelopeError::InvalidFormat`] if the bytes are truncated or
/// carry the wrong magic, and [`EnvelopeError::AeadFailure`] if the envelope
/// was not sealed to `recipient` or was tampered with.
pub fn open(envelope: &[u8], recipient: &IdentityKeypair) -> Result<OpenedEnvelope, EnvelopeError> {
    if envelope.len() < FIXED_HEADER_LEN + TAG_LEN || &envelope[..MAGIC.len()] != MAGIC {
        return Err(EnvelopeError::InvalidFormat);
    }

    let mut offset = MAGIC.len();
    let mut sender_bytes = [0u8; PUBLIC_KEY_LEN];
    sender_bytes.copy_from_slice(&envelope[offset..offset + PUBLIC_KEY_LEN]);
    offset += PUBLIC_KEY_LEN;

    let nonce = &envelope[offset..offset + NONCE_LEN];
    offset += NONCE_LEN;

    let label_len = envelope[offset] as usize;
    offset += 1;
    if envelope.len() < offset + label_len + TAG_LEN {
        return Err(EnvelopeError::InvalidFormat);
    }
    let label = std::str::from_utf8(&envelope[offset..offset + label_len])
        .map_err(|_| EnvelopeError::InvalidFormat)?
        .to_owned();
    offset += label_len;

    let (header, sealed) = envelope.split_at(offset);
    let sender = IdentityKey::from_bytes(sender_bytes);

    let cipher = derive_cipher(recipient, &sender, &sender, recipient.public())?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: header,
            },
        )
        .map_err(|_| EnvelopeError::AeadFailure)?;

    Ok(OpenedEnvelope {
        label,
        plaintext,
        sender,
    })
}

/// Derive the per-pair AEAD cipher. `ours`/`theirs` drive the Diffie-Hellman;
/// `sender`/`recipient` fix the KDF input order so both sides agree.
fn derive_cipher(
    ours: &IdentityKeypair,
    theirs: &IdentityKey,
    sender: &IdentityKey,
    recipient: &IdentityKey,
) -> Result<Aes256GcmSiv, EnvelopeError> {
    let shared = ours.secret().diffie_hellman(theirs.public_key());
    if !shared.was_contributory() {
        return Err(EnvelopeError::WeakKey);
    }

    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(shared.as_bytes())
        .map_err(|_| EnvelopeError::AeadFailure)?;
    mac.update(KDF_CONTEXT);
    mac.update(sender.as_bytes());
    mac.update(recipient.as_bytes());
    let key = mac.finalize().into_bytes();

    Aes256GcmSiv::new_from_slice(&key).map_err(|_| EnvelopeError::AeadFailure)
}
