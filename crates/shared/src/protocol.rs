use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BackendMessageId, ConversationId, KeyId, LocalMessageId, UserId};

/// Envelope algorithm tag for ChaCha20-Poly1305 with a 256-bit key.
/// New ciphers get new tags; old envelopes keep decrypting under theirs.
pub const ALGORITHM_AEAD_256_V1: &str = "AEAD-256-v1";

/// Serialized encrypted message body. The wire shape is stable:
/// `{ "ciphertext": "<base64>", "iv": "<base64>", "keyId": "...", "algorithm": "AEAD-256-v1" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub iv: String,
    #[serde(rename = "keyId")]
    pub key_id: KeyId,
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Plaintext { text: String },
    Encrypted { envelope: Envelope },
    /// Placeholder for an envelope that could not be decrypted. Rendered
    /// as-is; never retried through the crypto pipeline.
    Unreadable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

/// Identity of a message across its optimistic-local and backend-confirmed
/// lives. The local id is the idempotency key; reconciliation upgrades
/// `Local` to `Confirmed` in place instead of inserting a second copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageIdentity {
    Local {
        local_id: LocalMessageId,
    },
    Confirmed {
        local_id: LocalMessageId,
        backend_id: BackendMessageId,
    },
}

impl MessageIdentity {
    pub fn idempotency_key(&self) -> &LocalMessageId {
        match self {
            MessageIdentity::Local { local_id } => local_id,
            MessageIdentity::Confirmed { local_id, .. } => local_id,
        }
    }

    pub fn backend_id(&self) -> Option<&BackendMessageId> {
        match self {
            MessageIdentity::Local { .. } => None,
            MessageIdentity::Confirmed { backend_id, .. } => Some(backend_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub identity: MessageIdentity,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new_pending(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: MessageBody,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity: MessageIdentity::Local {
                local_id: LocalMessageId::generate(),
            },
            conversation_id,
            sender_id,
            body,
            status: MessageStatus::Pending,
            created_at,
            edited_at: None,
            deleted_at: None,
        }
    }
}

/// Effective encryption mode for a conversation at a given moment.
/// Recomputed on every relevant connection-state change and surfaced to UI
/// collaborators verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    PeerEncrypted,
    RelayEncrypted,
    Standard,
}

/// Per-conversation security policy as configured by its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfiguredSecurity {
    /// Encrypt peer-to-peer while the direct link is up, encrypted relay
    /// otherwise.
    PeerPreferred,
    /// Always encrypt, always deliver via the relay.
    RelayOnly,
    /// No application-layer encryption; backend-side protection only.
    Standard,
}

impl ConfiguredSecurity {
    pub fn permits_peer(self) -> bool {
        matches!(self, ConfiguredSecurity::PeerPreferred)
    }

    pub fn permits_encrypted_relay(self) -> bool {
        matches!(
            self,
            ConfiguredSecurity::PeerPreferred | ConfiguredSecurity::RelayOnly
        )
    }
}

/// Backend-confirmed message row, already normalized (see `adapter`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub backend_id: BackendMessageId,
    /// Echo of the client-generated idempotency key, when the row originated
    /// from a client that supplied one.
    pub local_id: Option<LocalMessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Realtime change-notification event scoped to one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BackendEvent {
    MessageInserted(MessageRow),
    MessageUpdated(MessageRow),
    MessageDeleted {
        backend_id: BackendMessageId,
        sender_id: UserId,
    },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
