use shared::domain::{KeyId, LocalMessageId, PeerId};
use thiserror::Error;

/// Failure to turn an envelope back into plaintext. Non-fatal: the pipeline
/// converts these into an unreadable-placeholder body.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("no session key found for key id {0}")]
    MissingKey(KeyId),
    #[error("unsupported envelope algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("envelope field '{field}' is malformed")]
    MalformedField { field: &'static str },
    #[error("integrity check failed for envelope under key {0}")]
    IntegrityCheckFailed(KeyId),
    #[error("decrypted payload is not valid UTF-8")]
    InvalidPlaintext,
}

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("AEAD encryption failed")]
    Cipher,
}

/// Peer negotiation failure. Never fatal: it only ever drives the
/// connection state machine toward `Fallback`.
#[derive(Debug, Error)]
#[error("peer negotiation failed for {peer_id}: {reason}")]
pub struct ConnectionError {
    pub peer_id: PeerId,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(peer_id: PeerId, reason: impl Into<String>) -> Self {
        Self {
            peer_id,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("backend write failed: {0}")]
    Backend(String),
    #[error("device is offline and offline queueing is disabled: {0}")]
    OfflineQueueUnavailable(#[from] OfflineStoreError),
    #[error("unknown message {0}")]
    UnknownMessage(LocalMessageId),
    #[error("message {0} has not been confirmed by the backend yet")]
    NotConfirmed(LocalMessageId),
    #[error("message {0} is not in a failed state; only failed messages can be resent")]
    NotResendable(LocalMessageId),
}

/// The local persistent store is unavailable or corrupted. This is the one
/// hard failure in the layer: offline queueing is disabled and delivery
/// cannot be guaranteed while disconnected.
#[derive(Debug, Clone, Error)]
#[error("local persistent store unavailable: {reason}")]
pub struct OfflineStoreError {
    pub reason: String,
}

impl OfflineStoreError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
