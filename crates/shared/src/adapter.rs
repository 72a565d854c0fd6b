//! Ingestion adapter for backend message rows.
//!
//! The backend's message table accumulated field-name variants over time
//! (camelCase and snake_case spellings of the same logical columns, and a
//! body that is either a plaintext `content` column or a serialized
//! envelope). Rows are normalized here, once, into [`MessageRow`]; nothing
//! past this boundary branches on field spelling.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    domain::{BackendMessageId, ConversationId, LocalMessageId, UserId},
    protocol::{Envelope, MessageBody, MessageRow},
};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("message row {backend_id} is missing a sender id")]
    MissingSender { backend_id: String },
    #[error("message row {backend_id} is missing a creation timestamp")]
    MissingCreatedAt { backend_id: String },
    #[error("message row {backend_id} carries neither content nor an envelope")]
    MissingBody { backend_id: String },
}

/// Raw row as selected from the backend, tolerant of legacy spellings.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessageRow {
    pub id: String,
    #[serde(default, alias = "clientId", alias = "local_id")]
    pub client_id: Option<String>,
    #[serde(alias = "conversationId", alias = "chat_id")]
    pub conversation_id: String,
    #[serde(default, alias = "senderId", alias = "sender", alias = "user_id")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "encryptedContent", alias = "encrypted_content")]
    pub envelope: Option<Envelope>,
    #[serde(default, alias = "createdAt", alias = "created")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "editedAt", alias = "updated_at")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "deletedAt")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RawMessageRow {
    pub fn normalize(self) -> Result<MessageRow, AdapterError> {
        let sender_id = self.sender_id.ok_or_else(|| AdapterError::MissingSender {
            backend_id: self.id.clone(),
        })?;
        let created_at = self
            .created_at
            .ok_or_else(|| AdapterError::MissingCreatedAt {
                backend_id: self.id.clone(),
            })?;
        // An envelope wins over a stray plaintext column: encrypted rows in
        // the legacy schema sometimes carried both.
        let body = match (self.envelope, self.content) {
            (Some(envelope), _) => MessageBody::Encrypted { envelope },
            (None, Some(text)) => MessageBody::Plaintext { text },
            (None, None) => {
                return Err(AdapterError::MissingBody {
                    backend_id: self.id,
                })
            }
        };

        Ok(MessageRow {
            backend_id: BackendMessageId(self.id),
            local_id: self.client_id.map(LocalMessageId),
            conversation_id: ConversationId(self.conversation_id),
            sender_id: UserId(sender_id),
            body,
            created_at,
            edited_at: self.edited_at,
            deleted_at: self.deleted_at,
        })
    }
}

#[cfg(test)]
#[path = "tests/adapter_tests.rs"]
mod tests;
