//! Versioned encryption envelope for message bodies.
//!
//! ChaCha20-Poly1305 with a 256-bit key and a random 96-bit nonce, tagged
//! `AEAD-256-v1`. The conversation id is bound as associated data, so an
//! envelope replayed into a different conversation fails its integrity
//! check. Decrypt failures are values, not panics: the pipeline converts
//! them into an unreadable placeholder body.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use shared::protocol::{Envelope, MessageBody, ALGORITHM_AEAD_256_V1};
use tracing::warn;

use crate::{
    error::{DecryptionError, EncryptionError},
    keys::SessionKey,
};

const NONCE_LEN: usize = 12;

pub fn encrypt(plaintext: &str, key: &SessionKey) -> Result<Envelope, EncryptionError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.material()));
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext.as_bytes(),
                aad: key.conversation_id.as_str().as_bytes(),
            },
        )
        .map_err(|_| EncryptionError::Cipher)?;

    Ok(Envelope {
        ciphertext: STANDARD.encode(ciphertext),
        iv: STANDARD.encode(iv),
        key_id: key.key_id.clone(),
        algorithm: ALGORITHM_AEAD_256_V1.to_string(),
    })
}

pub fn decrypt(envelope: &Envelope, key: &SessionKey) -> Result<String, DecryptionError> {
    if envelope.algorithm != ALGORITHM_AEAD_256_V1 {
        return Err(DecryptionError::UnsupportedAlgorithm(
            envelope.algorithm.clone(),
        ));
    }

    let iv = STANDARD
        .decode(&envelope.iv)
        .map_err(|_| DecryptionError::MalformedField { field: "iv" })?;
    if iv.len() != NONCE_LEN {
        return Err(DecryptionError::MalformedField { field: "iv" });
    }
    let ciphertext = STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|_| DecryptionError::MalformedField { field: "ciphertext" })?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.material()));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &ciphertext,
                aad: key.conversation_id.as_str().as_bytes(),
            },
        )
        .map_err(|_| DecryptionError::IntegrityCheckFailed(envelope.key_id.clone()))?;

    String::from_utf8(plaintext).map_err(|_| DecryptionError::InvalidPlaintext)
}

/// Decrypts with a key resolved from history. A lookup miss is
/// [`DecryptionError::MissingKey`], a normal representable outcome.
pub fn decrypt_with_lookup(
    envelope: &Envelope,
    key: Option<&SessionKey>,
) -> Result<String, DecryptionError> {
    let key = key.ok_or_else(|| DecryptionError::MissingKey(envelope.key_id.clone()))?;
    decrypt(envelope, key)
}

/// Pipeline boundary: turns an envelope into a renderable body, converting
/// any decrypt failure into the unreadable placeholder.
pub fn body_from_envelope(envelope: &Envelope, key: Option<&SessionKey>) -> MessageBody {
    match decrypt_with_lookup(envelope, key) {
        Ok(text) => MessageBody::Plaintext { text },
        Err(err) => {
            warn!(key_id = %envelope.key_id, "codec: rendering unreadable placeholder: {err}");
            MessageBody::Unreadable
        }
    }
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
