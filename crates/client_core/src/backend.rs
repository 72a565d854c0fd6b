//! Backend collaborator boundary.
//!
//! Message rows, session-key rows and the realtime change-notification
//! subscription all live behind this trait. The key-creation race is
//! resolved with the conditional-write primitive `insert_key_if_absent`:
//! a locally generated key is never canonical until that write confirms.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use shared::{
    adapter::RawMessageRow,
    domain::{BackendMessageId, ConversationId, KeyId, LocalMessageId, UserId},
    protocol::{BackendEvent, MessageBody, MessageRow},
};

/// Outgoing message write. `local_id` is the idempotency key; the backend
/// treats a second insert with the same `local_id` as a no-op returning the
/// existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessageRecord {
    pub local_id: LocalMessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
}

/// Backend-assigned metadata merged into the local message on confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedWrite {
    pub backend_id: BackendMessageId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInsertOutcome {
    Inserted,
    /// Another writer inserted an active key for the conversation first.
    Conflict,
}

/// Serialized form of a session key as stored by the backend and mirrored
/// into the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeyRecord {
    pub key_id: KeyId,
    pub conversation_id: ConversationId,
    pub material_b64: String,
    pub created_at: DateTime<Utc>,
    pub supersedes: Option<KeyId>,
    pub active: bool,
}

#[async_trait]
pub trait MessageBackend: Send + Sync {
    async fn insert_message(&self, record: NewMessageRecord) -> Result<ConfirmedWrite>;

    async fn select_message_by_local_id(
        &self,
        conversation_id: &ConversationId,
        local_id: &LocalMessageId,
    ) -> Result<Option<MessageRow>>;

    /// Recent rows for a conversation, oldest first. Rows come back raw and
    /// are normalized through `shared::adapter` at ingestion.
    async fn select_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<RawMessageRow>>;

    async fn update_message(
        &self,
        backend_id: &BackendMessageId,
        body: MessageBody,
        edited_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_message(&self, backend_id: &BackendMessageId) -> Result<()>;

    async fn fetch_active_key(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<SessionKeyRecord>>;

    async fn fetch_key_by_id(&self, key_id: &KeyId) -> Result<Option<SessionKeyRecord>>;

    /// Conditional write: inserts `record` as the conversation's active key
    /// only if no active key exists yet.
    async fn insert_key_if_absent(&self, record: SessionKeyRecord) -> Result<KeyInsertOutcome>;

    /// Installs a rotated key as the new active key. The superseded key
    /// stays readable through `fetch_key_by_id` indefinitely.
    async fn insert_rotated_key(&self, record: SessionKeyRecord) -> Result<()>;

    /// Realtime change-notification events scoped to one conversation.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<BoxStream<'static, BackendEvent>>;
}
