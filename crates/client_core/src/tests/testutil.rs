//! In-memory fakes shared across component tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use shared::{
    adapter::RawMessageRow,
    domain::{BackendMessageId, ConversationId, KeyId, LocalMessageId, PeerId},
    protocol::{BackendEvent, MessageBody, MessageRow},
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    backend::{
        ConfirmedWrite, KeyInsertOutcome, MessageBackend, NewMessageRecord, SessionKeyRecord,
    },
    error::ConnectionError,
    store::OfflineStore,
    transport::{PeerTransport, TransportEvent},
};

pub struct FakeTransport {
    events: broadcast::Sender<TransportEvent>,
    pub connect_calls: Mutex<Vec<PeerId>>,
    pub sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            connect_calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn connect(&self, peer_id: &PeerId) -> Result<(), ConnectionError> {
        self.connect_calls.lock().unwrap().push(peer_id.clone());
        Ok(())
    }

    async fn send(&self, peer_id: &PeerId, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        self.sent.lock().unwrap().push((peer_id.clone(), bytes));
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[derive(Default)]
struct BackendInner {
    rows: Vec<MessageRow>,
    next_row: u64,
    active_keys: HashMap<ConversationId, SessionKeyRecord>,
    keys_by_id: HashMap<KeyId, SessionKeyRecord>,
    key_insert_calls: u32,
}

pub struct FakeBackend {
    inner: Mutex<BackendInner>,
    insert_attempts: AtomicU32,
    fail_next_inserts: AtomicU32,
    /// While positive, `fetch_active_key` pretends no key exists. Lets
    /// tests force two writers into the conditional-insert race.
    suppress_active_fetch: AtomicU32,
    events: broadcast::Sender<BackendEvent>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            inner: Mutex::new(BackendInner::default()),
            insert_attempts: AtomicU32::new(0),
            fail_next_inserts: AtomicU32::new(0),
            suppress_active_fetch: AtomicU32::new(0),
            events,
        })
    }

    pub fn fail_next_inserts(&self, count: u32) {
        self.fail_next_inserts.store(count, Ordering::SeqCst);
    }

    pub fn suppress_active_fetch(&self, count: u32) {
        self.suppress_active_fetch.store(count, Ordering::SeqCst);
    }

    pub fn insert_attempts(&self) -> u32 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn key_insert_calls(&self) -> u32 {
        self.inner.lock().unwrap().key_insert_calls
    }

    pub fn rows(&self) -> Vec<MessageRow> {
        self.inner.lock().unwrap().rows.clone()
    }

    pub fn push_row(&self, row: MessageRow) {
        self.inner.lock().unwrap().rows.push(row);
    }

    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MessageBackend for FakeBackend {
    async fn insert_message(&self, record: NewMessageRecord) -> Result<ConfirmedWrite> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_inserts.load(Ordering::SeqCst) > 0 {
            self.fail_next_inserts.fetch_sub(1, Ordering::SeqCst);
            bail!("backend unavailable");
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .rows
            .iter()
            .find(|row| row.local_id.as_ref() == Some(&record.local_id))
        {
            return Ok(ConfirmedWrite {
                backend_id: existing.backend_id.clone(),
                created_at: existing.created_at,
            });
        }
        inner.next_row += 1;
        let backend_id = BackendMessageId::new(format!("m-{}", inner.next_row));
        let row = MessageRow {
            backend_id: backend_id.clone(),
            local_id: Some(record.local_id),
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            body: record.body,
            created_at: record.created_at,
            edited_at: None,
            deleted_at: None,
        };
        let created_at = row.created_at;
        inner.rows.push(row);
        Ok(ConfirmedWrite {
            backend_id,
            created_at,
        })
    }

    async fn select_message_by_local_id(
        &self,
        conversation_id: &ConversationId,
        local_id: &LocalMessageId,
    ) -> Result<Option<MessageRow>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rows
            .iter()
            .find(|row| {
                row.conversation_id == *conversation_id && row.local_id.as_ref() == Some(local_id)
            })
            .cloned())
    }

    async fn select_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<RawMessageRow>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rows
            .iter()
            .filter(|row| row.conversation_id == *conversation_id)
            .take(limit as usize)
            .map(|row| {
                let (content, envelope) = match &row.body {
                    MessageBody::Plaintext { text } => (Some(text.clone()), None),
                    MessageBody::Encrypted { envelope } => (None, Some(envelope.clone())),
                    MessageBody::Unreadable => (None, None),
                };
                RawMessageRow {
                    id: row.backend_id.0.clone(),
                    client_id: row.local_id.as_ref().map(|id| id.0.clone()),
                    conversation_id: row.conversation_id.0.clone(),
                    sender_id: Some(row.sender_id.0.clone()),
                    content,
                    envelope,
                    created_at: Some(row.created_at),
                    edited_at: row.edited_at,
                    deleted_at: row.deleted_at,
                }
            })
            .collect())
    }

    async fn update_message(
        &self,
        backend_id: &BackendMessageId,
        body: MessageBody,
        edited_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner
            .rows
            .iter_mut()
            .find(|row| row.backend_id == *backend_id)
        {
            row.body = body;
            row.edited_at = Some(edited_at);
        }
        Ok(())
    }

    async fn delete_message(&self, backend_id: &BackendMessageId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.rows.retain(|row| row.backend_id != *backend_id);
        Ok(())
    }

    async fn fetch_active_key(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<SessionKeyRecord>> {
        if self.suppress_active_fetch.load(Ordering::SeqCst) > 0 {
            self.suppress_active_fetch.fetch_sub(1, Ordering::SeqCst);
            return Ok(None);
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .active_keys
            .get(conversation_id)
            .cloned())
    }

    async fn fetch_key_by_id(&self, key_id: &KeyId) -> Result<Option<SessionKeyRecord>> {
        Ok(self.inner.lock().unwrap().keys_by_id.get(key_id).cloned())
    }

    async fn insert_key_if_absent(&self, record: SessionKeyRecord) -> Result<KeyInsertOutcome> {
        let mut inner = self.inner.lock().unwrap();
        inner.key_insert_calls += 1;
        if inner.active_keys.contains_key(&record.conversation_id) {
            return Ok(KeyInsertOutcome::Conflict);
        }
        inner
            .keys_by_id
            .insert(record.key_id.clone(), record.clone());
        inner
            .active_keys
            .insert(record.conversation_id.clone(), record);
        Ok(KeyInsertOutcome::Inserted)
    }

    async fn insert_rotated_key(&self, record: SessionKeyRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.active_keys.get(&record.conversation_id).cloned() {
            if let Some(stored) = inner.keys_by_id.get_mut(&previous.key_id) {
                stored.active = false;
            }
        }
        inner
            .keys_by_id
            .insert(record.key_id.clone(), record.clone());
        inner
            .active_keys
            .insert(record.conversation_id.clone(), record);
        Ok(())
    }

    async fn subscribe(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<BoxStream<'static, BackendEvent>> {
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(|result| async move { result.ok() });
        Ok(stream.boxed())
    }
}
