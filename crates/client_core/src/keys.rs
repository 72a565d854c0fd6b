//! Session-key lifecycle: creation, the multi-writer creation race,
//! rotation, and history lookups for decrypting old envelopes.
//!
//! The backend is the canonical key store; the in-memory cache is
//! copy-on-write (rotation installs a new `Arc` with an extended history
//! map, so concurrent readers never observe a partial key set), and the
//! local store carries a best-effort mirror so history survives restarts.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use shared::domain::{ConversationId, KeyId};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    backend::{KeyInsertOutcome, MessageBackend, SessionKeyRecord},
    store::OfflineStore,
};

pub const KEY_LEN: usize = 32;

/// Symmetric key for one conversation. Material is wiped on drop and never
/// appears in `Debug` output.
#[derive(Clone)]
pub struct SessionKey {
    pub key_id: KeyId,
    pub conversation_id: ConversationId,
    material: Zeroizing<[u8; KEY_LEN]>,
    pub created_at: DateTime<Utc>,
    pub supersedes: Option<KeyId>,
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("key_id", &self.key_id)
            .field("conversation_id", &self.conversation_id)
            .field("created_at", &self.created_at)
            .field("supersedes", &self.supersedes)
            .finish_non_exhaustive()
    }
}

impl SessionKey {
    pub fn generate(conversation_id: ConversationId, supersedes: Option<KeyId>) -> Self {
        let mut material = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(material.as_mut());
        Self {
            key_id: KeyId::generate(),
            conversation_id,
            material,
            created_at: Utc::now(),
            supersedes,
        }
    }

    pub fn material(&self) -> &[u8; KEY_LEN] {
        &self.material
    }

    pub fn to_record(&self, active: bool) -> SessionKeyRecord {
        SessionKeyRecord {
            key_id: self.key_id.clone(),
            conversation_id: self.conversation_id.clone(),
            material_b64: STANDARD.encode(self.material.as_ref()),
            created_at: self.created_at,
            supersedes: self.supersedes.clone(),
            active,
        }
    }

    pub fn from_record(record: &SessionKeyRecord) -> Result<Self> {
        let decoded = STANDARD
            .decode(&record.material_b64)
            .with_context(|| format!("invalid key material encoding for key {}", record.key_id))?;
        if decoded.len() != KEY_LEN {
            return Err(anyhow!(
                "key {} has {} bytes of material, expected {KEY_LEN}",
                record.key_id,
                decoded.len()
            ));
        }
        let mut material = Zeroizing::new([0u8; KEY_LEN]);
        material.copy_from_slice(&decoded);
        Ok(Self {
            key_id: record.key_id.clone(),
            conversation_id: record.conversation_id.clone(),
            material,
            created_at: record.created_at,
            supersedes: record.supersedes.clone(),
        })
    }
}

struct ConversationKeys {
    /// `None` when only superseded keys have been seen so far, e.g. a
    /// cache-cold manager that decrypted history before sending anything.
    active: Option<SessionKey>,
    /// Every key ever seen for the conversation, the active one included.
    /// Extended on rotation, never shrunk.
    history: HashMap<KeyId, SessionKey>,
}

pub struct KeyManager {
    backend: Arc<dyn MessageBackend>,
    mirror: Option<Arc<dyn OfflineStore>>,
    cache: RwLock<HashMap<ConversationId, Arc<ConversationKeys>>>,
}

fn mirror_entry_key(key_id: &KeyId) -> String {
    format!("keys/{key_id}")
}

impl KeyManager {
    pub fn new(backend: Arc<dyn MessageBackend>, mirror: Option<Arc<dyn OfflineStore>>) -> Self {
        Self {
            backend,
            mirror,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Active key for the conversation, creating one if none exists yet.
    ///
    /// Creation is a conditional insert: on conflict the locally generated
    /// key is discarded and the now-canonical key is adopted instead. The
    /// generated key is never handed out until the insert has confirmed.
    pub async fn get_or_create_key(&self, conversation_id: &ConversationId) -> Result<SessionKey> {
        if let Some(active) = self.cached(conversation_id).and_then(|keys| keys.active.clone()) {
            return Ok(active);
        }

        if let Some(record) = self.backend.fetch_active_key(conversation_id).await? {
            let key = SessionKey::from_record(&record)?;
            self.extend_history(key.clone(), true);
            self.mirror_record(&record).await;
            return Ok(key);
        }

        let candidate = SessionKey::generate(conversation_id.clone(), None);
        let record = candidate.to_record(true);
        match self.backend.insert_key_if_absent(record.clone()).await? {
            KeyInsertOutcome::Inserted => {
                info!(conversation_id = %conversation_id, key_id = %candidate.key_id, "keys: created session key");
                self.extend_history(candidate.clone(), true);
                self.mirror_record(&record).await;
                Ok(candidate)
            }
            KeyInsertOutcome::Conflict => {
                // Lost the creation race; the candidate is dropped (and
                // zeroized) and the canonical key is fetched instead.
                debug!(conversation_id = %conversation_id, "keys: creation race lost, adopting canonical key");
                let record = self
                    .backend
                    .fetch_active_key(conversation_id)
                    .await?
                    .ok_or_else(|| {
                        anyhow!(
                            "no active key for conversation {conversation_id} after insert conflict"
                        )
                    })?;
                let key = SessionKey::from_record(&record)?;
                self.extend_history(key.clone(), true);
                self.mirror_record(&record).await;
                Ok(key)
            }
        }
    }

    /// Issues a new active key superseding the current one. The superseded
    /// key stays in the history table for decrypting old envelopes.
    pub async fn rotate_key(&self, conversation_id: &ConversationId) -> Result<SessionKey> {
        let current = self.get_or_create_key(conversation_id).await?;
        let rotated =
            SessionKey::generate(conversation_id.clone(), Some(current.key_id.clone()));
        let record = rotated.to_record(true);
        self.backend
            .insert_rotated_key(record.clone())
            .await
            .with_context(|| format!("failed to persist rotated key for {conversation_id}"))?;
        self.extend_history(rotated.clone(), true);
        self.mirror_record(&record).await;
        self.mirror_record(&current.to_record(false)).await;
        info!(
            conversation_id = %conversation_id,
            key_id = %rotated.key_id,
            supersedes = %current.key_id,
            "keys: rotated session key"
        );
        Ok(rotated)
    }

    /// History lookup for decryption. A missing key is a normal outcome and
    /// comes back as `None`; lookup failures are logged and treated the
    /// same, since the caller renders a placeholder either way.
    pub async fn resolve_key_for_decrypt(&self, key_id: &KeyId) -> Option<SessionKey> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            for keys in cache.values() {
                if let Some(key) = keys.history.get(key_id) {
                    return Some(key.clone());
                }
            }
        }

        if let Some(store) = &self.mirror {
            match store.get(&mirror_entry_key(key_id)).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<SessionKeyRecord>(&bytes) {
                    Ok(record) => match SessionKey::from_record(&record) {
                        Ok(key) => {
                            self.extend_history(key.clone(), record.active);
                            return Some(key);
                        }
                        Err(err) => warn!(key_id = %key_id, "keys: corrupt mirrored key: {err}"),
                    },
                    Err(err) => warn!(key_id = %key_id, "keys: corrupt mirror entry: {err}"),
                },
                Ok(None) => {}
                Err(err) => warn!(key_id = %key_id, "keys: mirror lookup failed: {err}"),
            }
        }

        match self.backend.fetch_key_by_id(key_id).await {
            Ok(Some(record)) => match SessionKey::from_record(&record) {
                Ok(key) => {
                    self.extend_history(key.clone(), record.active);
                    self.mirror_record(&record).await;
                    Some(key)
                }
                Err(err) => {
                    warn!(key_id = %key_id, "keys: corrupt backend key record: {err}");
                    None
                }
            },
            Ok(None) => {
                debug!(key_id = %key_id, "keys: no key found in history");
                None
            }
            Err(err) => {
                warn!(key_id = %key_id, "keys: backend key lookup failed: {err}");
                None
            }
        }
    }

    fn cached(&self, conversation_id: &ConversationId) -> Option<Arc<ConversationKeys>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(conversation_id).cloned()
    }

    /// Copy-on-write cache update: builds a replacement key set that keeps
    /// every previously known key and installs it atomically.
    fn extend_history(&self, key: SessionKey, is_active: bool) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let conversation_id = key.conversation_id.clone();
        let replacement = match cache.get(&conversation_id) {
            Some(existing) => {
                let mut history = existing
                    .history
                    .iter()
                    .map(|(id, k)| (id.clone(), k.clone()))
                    .collect::<HashMap<_, _>>();
                history.insert(key.key_id.clone(), key.clone());
                ConversationKeys {
                    active: if is_active {
                        Some(key)
                    } else {
                        existing.active.clone()
                    },
                    history,
                }
            }
            None => {
                let mut history = HashMap::new();
                history.insert(key.key_id.clone(), key.clone());
                ConversationKeys {
                    active: is_active.then_some(key),
                    history,
                }
            }
        };
        cache.insert(conversation_id, Arc::new(replacement));
    }

    async fn mirror_record(&self, record: &SessionKeyRecord) {
        let Some(store) = &self.mirror else {
            return;
        };
        match serde_json::to_vec(record) {
            Ok(bytes) => {
                if let Err(err) = store.put(&mirror_entry_key(&record.key_id), &bytes).await {
                    warn!(key_id = %record.key_id, "keys: failed to mirror key locally: {err}");
                }
            }
            Err(err) => warn!(key_id = %record.key_id, "keys: failed to serialize key mirror: {err}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/keys_tests.rs"]
mod tests;
