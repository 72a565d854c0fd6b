//! Outgoing delivery queue: optimistic local entries, bounded-backoff
//! retries, offline persistence and replay, and reconciliation with
//! backend-confirmed state.
//!
//! Entries are processed FIFO within a conversation lane; lanes run
//! concurrently on their own tasks. Reconciliation is keyed by the
//! client-generated idempotency key, so a confirmed write is merged into
//! the existing local entity instead of inserting a second visible copy.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{BackendMessageId, ConversationId, LocalMessageId, PeerId, UserId},
    protocol::{
        BackendEvent, ConfiguredSecurity, Message, MessageBody, MessageIdentity, MessageRow,
        MessageStatus, SecurityLevel,
    },
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    backend::{ConfirmedWrite, MessageBackend, NewMessageRecord},
    codec,
    connection::{ConnectionState, ConnectionSupervisor},
    error::{DeliveryError, OfflineStoreError},
    keys::KeyManager,
    scheduler::RetryScheduler,
    security,
    session::SessionContext,
    store::OfflineStore,
};

/// Offline outbox capacity. Beyond this the oldest entry is evicted.
pub const MAX_OFFLINE_ENTRIES: usize = 100;

const OUTBOX_PREFIX: &str = "outbox/";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `retry_count` failures:
    /// `base * 2^(retry_count - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Persisted outbox entry. Each entry is independent; the storage key
/// encodes enqueue order within its conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingQueueEntry {
    pub message: Message,
    pub retry_count: u32,
    pub next_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub configured: ConfiguredSecurity,
    /// Remote peer for direct conversations; `None` for relay-only and
    /// group conversations.
    pub peer_id: Option<PeerId>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            configured: ConfiguredSecurity::Standard,
            peer_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    /// Optimistic local entry, visible immediately.
    MessagePending(Message),
    /// Backend metadata merged into the same local entity.
    MessageConfirmed(Message),
    /// Retry budget exhausted; waiting for an explicit resend.
    MessageFailed(Message),
    /// Inbound message from another participant, already decrypted (or
    /// rendered unreadable).
    MessageReceived(Message),
    /// Sender-applied edit overlay.
    MessageUpdated(Message),
    /// Sender-applied delete overlay.
    MessageDeleted {
        conversation_id: ConversationId,
        backend_id: BackendMessageId,
    },
}

#[derive(Default)]
struct Lane {
    queue: VecDeque<LocalMessageId>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct QueueState {
    online: bool,
    configs: HashMap<ConversationId, ConversationConfig>,
    ledger: HashMap<LocalMessageId, Message>,
    lanes: HashMap<ConversationId, Lane>,
    outbox_keys: HashMap<LocalMessageId, String>,
    outbox_seq: u64,
    remote_senders: HashMap<ConversationId, HashMap<BackendMessageId, UserId>>,
    flushing: bool,
}

pub struct DeliveryQueue {
    backend: Arc<dyn MessageBackend>,
    keys: Arc<KeyManager>,
    supervisor: Arc<ConnectionSupervisor>,
    scheduler: Arc<dyn RetryScheduler>,
    session: SessionContext,
    offline: Option<Arc<dyn OfflineStore>>,
    policy: RetryPolicy,
    inner: Mutex<QueueState>,
    events: broadcast::Sender<DeliveryEvent>,
}

impl DeliveryQueue {
    pub fn new(
        backend: Arc<dyn MessageBackend>,
        keys: Arc<KeyManager>,
        supervisor: Arc<ConnectionSupervisor>,
        scheduler: Arc<dyn RetryScheduler>,
        session: SessionContext,
        offline: Option<Arc<dyn OfflineStore>>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        if offline.is_none() {
            error!(
                "delivery: local store unavailable, offline queueing disabled; \
                 delivery cannot be guaranteed while disconnected"
            );
        }
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            backend,
            keys,
            supervisor,
            scheduler,
            session,
            offline,
            policy,
            inner: Mutex::new(QueueState {
                online: true,
                ..QueueState::default()
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    pub async fn register_conversation(
        &self,
        conversation_id: ConversationId,
        config: ConversationConfig,
    ) {
        let mut state = self.inner.lock().await;
        state.configs.insert(conversation_id, config);
    }

    pub async fn message(&self, local_id: &LocalMessageId) -> Option<Message> {
        let state = self.inner.lock().await;
        state.ledger.get(local_id).cloned()
    }

    /// Security level currently in force for a conversation, for the UI
    /// indicator.
    pub async fn effective_security_level(&self, conversation_id: &ConversationId) -> SecurityLevel {
        let config = self.config_for(conversation_id).await;
        self.effective_level(&config).await
    }

    /// Accepts an outgoing message. The returned message is the optimistic
    /// `Pending` entry; confirmation or failure arrives as a
    /// [`DeliveryEvent`] keyed by the same idempotency key.
    pub async fn send(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        plaintext: &str,
    ) -> Result<Message, DeliveryError> {
        let online = {
            let state = self.inner.lock().await;
            state.online
        };

        let message = Message::new_pending(
            conversation_id.clone(),
            self.session.user_id.clone(),
            MessageBody::Plaintext {
                text: plaintext.to_string(),
            },
            Utc::now(),
        );
        let local_id = message.identity.idempotency_key().clone();
        {
            let mut state = self.inner.lock().await;
            state.ledger.insert(local_id.clone(), message.clone());
        }
        let _ = self.events.send(DeliveryEvent::MessagePending(message.clone()));

        if !online {
            let entry = OutgoingQueueEntry {
                message: message.clone(),
                retry_count: 0,
                next_attempt_at: Utc::now(),
            };
            if let Err(err) = self.persist_entry(&entry).await {
                self.mark_failed(&local_id).await;
                return Err(DeliveryError::OfflineQueueUnavailable(err));
            }
            info!(
                conversation_id = %conversation_id,
                local_id = %local_id,
                "delivery: device offline, message parked in outbox"
            );
            return Ok(message);
        }

        self.enqueue_lane(conversation_id.clone(), local_id).await;
        Ok(message)
    }

    /// Explicit, user-initiated retry of a failed message. Re-enters the
    /// queue as a fresh `Pending` attempt under the same idempotency key.
    pub async fn resend(
        self: &Arc<Self>,
        local_id: &LocalMessageId,
    ) -> Result<Message, DeliveryError> {
        let (message, online) = {
            let mut state = self.inner.lock().await;
            let online = state.online;
            let message = state
                .ledger
                .get_mut(local_id)
                .ok_or_else(|| DeliveryError::UnknownMessage(local_id.clone()))?;
            if message.status != MessageStatus::Failed {
                return Err(DeliveryError::NotResendable(local_id.clone()));
            }
            message.status = MessageStatus::Pending;
            (message.clone(), online)
        };
        let _ = self.events.send(DeliveryEvent::MessagePending(message.clone()));

        if !online {
            let entry = OutgoingQueueEntry {
                message: message.clone(),
                retry_count: 0,
                next_attempt_at: Utc::now(),
            };
            if let Err(err) = self.persist_entry(&entry).await {
                self.mark_failed(local_id).await;
                return Err(DeliveryError::OfflineQueueUnavailable(err));
            }
            return Ok(message);
        }

        self.enqueue_lane(message.conversation_id.clone(), local_id.clone())
            .await;
        Ok(message)
    }

    /// Replays every persisted outbox entry, conversations concurrently,
    /// entries within a conversation in their original enqueue order.
    /// Entries already confirmed server-side are reconciled, not
    /// re-inserted.
    pub async fn flush(self: &Arc<Self>) {
        let Some(store) = self.offline.clone() else {
            return;
        };
        {
            let mut state = self.inner.lock().await;
            if state.flushing {
                return;
            }
            state.flushing = true;
        }

        let entries = match store.list_prefix(OUTBOX_PREFIX).await {
            Ok(entries) => entries,
            Err(err) => {
                error!("delivery: failed to read offline outbox: {err}");
                self.inner.lock().await.flushing = false;
                return;
            }
        };

        let mut per_conversation: HashMap<ConversationId, Vec<(String, OutgoingQueueEntry)>> =
            HashMap::new();
        for (key, value) in entries {
            match serde_json::from_slice::<OutgoingQueueEntry>(&value) {
                Ok(entry) => per_conversation
                    .entry(entry.message.conversation_id.clone())
                    .or_default()
                    .push((key, entry)),
                Err(err) => {
                    warn!(key = %key, "delivery: dropping corrupt outbox entry: {err}");
                    let _ = store.delete(&key).await;
                }
            }
        }

        let mut handles = Vec::new();
        for (conversation_id, entries) in per_conversation {
            let queue = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                queue.replay_conversation(conversation_id, entries).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.inner.lock().await.flushing = false;
        info!("delivery: offline outbox flush complete");
    }

    /// Edits one of our own confirmed messages. The replacement body goes
    /// to the backend re-sealed under the conversation's current security
    /// level; the local copy keeps the plaintext.
    pub async fn edit_message(
        &self,
        local_id: &LocalMessageId,
        new_text: &str,
    ) -> Result<Message, DeliveryError> {
        let message = self
            .message(local_id)
            .await
            .ok_or_else(|| DeliveryError::UnknownMessage(local_id.clone()))?;
        let Some(backend_id) = message.identity.backend_id().cloned() else {
            return Err(DeliveryError::NotConfirmed(local_id.clone()));
        };

        let (body, _) = self
            .wire_body(&message.conversation_id, new_text)
            .await
            .map_err(|err| DeliveryError::Backend(err.to_string()))?;
        let edited_at = Utc::now();
        self.backend
            .update_message(&backend_id, body, edited_at)
            .await
            .map_err(|err| DeliveryError::Backend(err.to_string()))?;

        let snapshot = {
            let mut state = self.inner.lock().await;
            let Some(message) = state.ledger.get_mut(local_id) else {
                return Err(DeliveryError::UnknownMessage(local_id.clone()));
            };
            message.body = MessageBody::Plaintext {
                text: new_text.to_string(),
            };
            message.edited_at = Some(edited_at);
            message.clone()
        };
        let _ = self
            .events
            .send(DeliveryEvent::MessageUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Deletes one of our own confirmed messages from the backend.
    pub async fn delete_message(&self, local_id: &LocalMessageId) -> Result<(), DeliveryError> {
        let message = self
            .message(local_id)
            .await
            .ok_or_else(|| DeliveryError::UnknownMessage(local_id.clone()))?;
        let Some(backend_id) = message.identity.backend_id().cloned() else {
            return Err(DeliveryError::NotConfirmed(local_id.clone()));
        };

        self.backend
            .delete_message(&backend_id)
            .await
            .map_err(|err| DeliveryError::Backend(err.to_string()))?;

        {
            let mut state = self.inner.lock().await;
            if let Some(message) = state.ledger.get_mut(local_id) {
                message.deleted_at = Some(Utc::now());
            }
        }
        let _ = self.events.send(DeliveryEvent::MessageDeleted {
            conversation_id: message.conversation_id,
            backend_id,
        });
        Ok(())
    }

    /// Cancels the conversation's active retry processing and drops its
    /// in-memory bookkeeping. Persisted outbox entries are never dropped;
    /// queued-but-unpersisted entries are parked in the outbox first when a
    /// store is available, and a later `flush` rebuilds their ledger state
    /// from the persisted entries.
    pub async fn close_conversation(&self, conversation_id: &ConversationId) {
        let (worker, queued) = {
            let mut state = self.inner.lock().await;
            let Some(lane) = state.lanes.get_mut(conversation_id) else {
                return;
            };
            let worker = lane.worker.take();
            let queued: Vec<LocalMessageId> = lane.queue.drain(..).collect();
            (worker, queued)
        };
        if let Some(worker) = worker {
            worker.abort();
        }
        for local_id in queued {
            if let Some(message) = self.message(&local_id).await {
                let entry = OutgoingQueueEntry {
                    message,
                    retry_count: 0,
                    next_attempt_at: Utc::now(),
                };
                if let Err(err) = self.persist_entry(&entry).await {
                    warn!(
                        local_id = %local_id,
                        "delivery: could not park queued message on close: {err}"
                    );
                }
            }
        }

        // Failed entries stay resendable; pending entries without a
        // persisted copy have nowhere else to live.
        {
            let mut state = self.inner.lock().await;
            state.lanes.remove(conversation_id);
            state.remote_senders.remove(conversation_id);
            let prunable: Vec<LocalMessageId> = state
                .ledger
                .iter()
                .filter(|(local_id, message)| {
                    message.conversation_id == *conversation_id
                        && (message.status == MessageStatus::Sent
                            || (message.status == MessageStatus::Pending
                                && state.outbox_keys.contains_key(*local_id)))
                })
                .map(|(local_id, _)| local_id.clone())
                .collect();
            for local_id in &prunable {
                state.ledger.remove(local_id);
                state.outbox_keys.remove(local_id);
            }
        }
        info!(conversation_id = %conversation_id, "delivery: conversation retries cancelled");
    }

    /// Watches the connectivity flag and flushes the outbox on every
    /// offline→online edge.
    pub fn spawn_connectivity_task(
        self: &Arc<Self>,
        mut connectivity: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut state = queue.inner.lock().await;
                state.online = *connectivity.borrow();
            }
            while connectivity.changed().await.is_ok() {
                let online = *connectivity.borrow();
                let was_online = {
                    let mut state = queue.inner.lock().await;
                    std::mem::replace(&mut state.online, online)
                };
                if online && !was_online {
                    info!("delivery: connectivity restored, flushing offline outbox");
                    queue.flush().await;
                }
            }
        })
    }

    /// Consumes the backend's realtime change notifications for one
    /// conversation: confirms own writes (covers the ack-lost-to-a-blip
    /// case) and applies sender-only edit/delete overlays.
    pub async fn spawn_backend_event_task(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<JoinHandle<()>, DeliveryError> {
        let mut stream = self
            .backend
            .subscribe(&conversation_id)
            .await
            .map_err(|err| DeliveryError::Backend(err.to_string()))?;
        let queue = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                queue.apply_backend_event(&conversation_id, event).await;
            }
        }))
    }

    /// Recent conversation history, normalized and decrypted.
    pub async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, DeliveryError> {
        let rows = self
            .backend
            .select_messages(conversation_id, limit)
            .await
            .map_err(|err| DeliveryError::Backend(err.to_string()))?;

        let mut messages = Vec::with_capacity(rows.len());
        for raw in rows {
            match raw.normalize() {
                Ok(row) => {
                    {
                        let mut state = self.inner.lock().await;
                        state
                            .remote_senders
                            .entry(conversation_id.clone())
                            .or_default()
                            .insert(row.backend_id.clone(), row.sender_id.clone());
                    }
                    messages.push(self.message_from_row(row).await);
                }
                Err(err) => warn!(
                    conversation_id = %conversation_id,
                    "delivery: dropping malformed history row: {err}"
                ),
            }
        }
        Ok(messages)
    }

    async fn config_for(&self, conversation_id: &ConversationId) -> ConversationConfig {
        let state = self.inner.lock().await;
        state
            .configs
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn effective_level(&self, config: &ConversationConfig) -> SecurityLevel {
        let connection = match &config.peer_id {
            Some(peer_id) => self.supervisor.state(peer_id).await,
            None => ConnectionState::disconnected(),
        };
        security::resolve(config.configured, &connection)
    }

    async fn enqueue_lane(self: &Arc<Self>, conversation_id: ConversationId, local_id: LocalMessageId) {
        let mut state = self.inner.lock().await;
        let lane = state.lanes.entry(conversation_id.clone()).or_default();
        lane.queue.push_back(local_id);
        let worker_running = lane
            .worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false);
        if !worker_running {
            let queue = Arc::clone(self);
            lane.worker = Some(tokio::spawn(async move {
                queue.run_lane(conversation_id).await;
            }));
        }
    }

    async fn run_lane(self: Arc<Self>, conversation_id: ConversationId) {
        loop {
            let next = {
                let mut state = self.inner.lock().await;
                let lane = state.lanes.entry(conversation_id.clone()).or_default();
                match lane.queue.pop_front() {
                    Some(local_id) => Some(local_id),
                    None => {
                        // Cleared under the lock so a concurrent send spawns
                        // a fresh worker instead of racing this exit.
                        lane.worker = None;
                        None
                    }
                }
            };
            let Some(local_id) = next else {
                break;
            };
            self.process_message(&local_id, 0).await;
        }
    }

    /// One message through the attempt/backoff loop until confirmed,
    /// failed, or parked for a later flush.
    async fn process_message(self: &Arc<Self>, local_id: &LocalMessageId, initial_retry_count: u32) {
        let Some(message) = self.message(local_id).await else {
            return;
        };
        if message.status != MessageStatus::Pending {
            return;
        }

        let mut retry_count = initial_retry_count;
        loop {
            match self.attempt_delivery(&message).await {
                Ok(confirmed) => {
                    self.apply_confirmation(local_id, confirmed).await;
                    self.remove_offline_entry(local_id).await;
                    return;
                }
                Err(err) => {
                    retry_count += 1;
                    warn!(
                        local_id = %local_id,
                        attempt = retry_count,
                        max_attempts = self.policy.max_attempts,
                        "delivery: backend write failed: {err}"
                    );
                    if retry_count >= self.policy.max_attempts {
                        self.mark_failed(local_id).await;
                        self.remove_offline_entry(local_id).await;
                        return;
                    }

                    let delay = self.policy.backoff_delay(retry_count);
                    let entry = OutgoingQueueEntry {
                        message: message.clone(),
                        retry_count,
                        next_attempt_at: Utc::now()
                            + chrono::Duration::from_std(delay).unwrap_or_default(),
                    };
                    // Persisted before sleeping, so an interrupted backoff
                    // leaves the entry replayable.
                    if let Err(store_err) = self.persist_entry(&entry).await {
                        warn!(
                            local_id = %local_id,
                            "delivery: could not persist outbox entry: {store_err}"
                        );
                    }
                    self.scheduler.delay(delay).await;

                    let online = {
                        let state = self.inner.lock().await;
                        state.online
                    };
                    if !online {
                        info!(
                            local_id = %local_id,
                            "delivery: went offline during backoff, deferring to flush"
                        );
                        return;
                    }
                }
            }
        }
    }

    async fn replay_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        entries: Vec<(String, OutgoingQueueEntry)>,
    ) {
        for (key, entry) in entries {
            let local_id = entry.message.identity.idempotency_key().clone();
            {
                let mut state = self.inner.lock().await;
                state
                    .ledger
                    .entry(local_id.clone())
                    .or_insert_with(|| entry.message.clone());
                state.outbox_keys.insert(local_id.clone(), key.clone());
            }

            if let Some(current) = self.message(&local_id).await {
                if current.status == MessageStatus::Sent {
                    self.remove_offline_entry(&local_id).await;
                    continue;
                }
            }

            // Idempotency check: the write may have landed before the
            // connection blipped.
            match self
                .backend
                .select_message_by_local_id(&conversation_id, &local_id)
                .await
            {
                Ok(Some(row)) => {
                    info!(
                        local_id = %local_id,
                        backend_id = %row.backend_id,
                        "delivery: outbox entry already confirmed server-side"
                    );
                    self.apply_confirmation(
                        &local_id,
                        ConfirmedWrite {
                            backend_id: row.backend_id,
                            created_at: row.created_at,
                        },
                    )
                    .await;
                    self.remove_offline_entry(&local_id).await;
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(local_id = %local_id, "delivery: idempotency lookup failed: {err}");
                }
            }

            self.process_message(&local_id, entry.retry_count).await;
        }
    }

    /// Body as written to the backend: sealed in an envelope whenever the
    /// conversation's level at this moment calls for encryption.
    async fn wire_body(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> anyhow::Result<(MessageBody, SecurityLevel)> {
        let config = self.config_for(conversation_id).await;
        let level = self.effective_level(&config).await;
        let body = match level {
            SecurityLevel::PeerEncrypted | SecurityLevel::RelayEncrypted => {
                let key = self.keys.get_or_create_key(conversation_id).await?;
                let envelope = codec::encrypt(text, &key)?;
                MessageBody::Encrypted { envelope }
            }
            SecurityLevel::Standard => MessageBody::Plaintext {
                text: text.to_string(),
            },
        };
        Ok((body, level))
    }

    /// Performs the backend write. The security level is re-resolved on
    /// every attempt; an encrypting conversation never writes plaintext to
    /// the backend. Peer-encrypted envelopes are mirrored over the direct
    /// link best-effort; the backend write stays the canonical path.
    async fn attempt_delivery(&self, message: &Message) -> anyhow::Result<ConfirmedWrite> {
        let (body, level) = match &message.body {
            MessageBody::Plaintext { text } => {
                self.wire_body(&message.conversation_id, text).await?
            }
            other => (other.clone(), SecurityLevel::Standard),
        };

        if level == SecurityLevel::PeerEncrypted {
            let config = self.config_for(&message.conversation_id).await;
            if let (Some(peer_id), MessageBody::Encrypted { envelope }) = (&config.peer_id, &body)
            {
                match serde_json::to_vec(envelope) {
                    Ok(bytes) => {
                        if let Err(err) = self.supervisor.send_to_peer(peer_id, bytes).await {
                            warn!(peer_id = %peer_id, "delivery: peer-link send failed: {err}");
                        }
                    }
                    Err(err) => {
                        warn!("delivery: could not serialize envelope for peer link: {err}")
                    }
                }
            }
        }

        let record = NewMessageRecord {
            local_id: message.identity.idempotency_key().clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            body,
            created_at: message.created_at,
        };
        self.backend.insert_message(record).await
    }

    async fn apply_confirmation(&self, local_id: &LocalMessageId, confirmed: ConfirmedWrite) {
        let snapshot = {
            let mut state = self.inner.lock().await;
            let Some(message) = state.ledger.get_mut(local_id) else {
                return;
            };
            if message.status == MessageStatus::Sent {
                return;
            }
            message.identity = MessageIdentity::Confirmed {
                local_id: local_id.clone(),
                backend_id: confirmed.backend_id.clone(),
            };
            message.status = MessageStatus::Sent;
            message.created_at = confirmed.created_at;
            let snapshot = message.clone();
            state
                .remote_senders
                .entry(snapshot.conversation_id.clone())
                .or_default()
                .insert(confirmed.backend_id, snapshot.sender_id.clone());
            snapshot
        };
        info!(
            local_id = %local_id,
            backend_id = %snapshot.identity.backend_id().map(|id| id.as_str()).unwrap_or(""),
            "delivery: message confirmed"
        );
        let _ = self.events.send(DeliveryEvent::MessageConfirmed(snapshot));
    }

    async fn mark_failed(&self, local_id: &LocalMessageId) {
        let snapshot = {
            let mut state = self.inner.lock().await;
            let Some(message) = state.ledger.get_mut(local_id) else {
                return;
            };
            message.status = MessageStatus::Failed;
            message.clone()
        };
        error!(
            local_id = %local_id,
            "delivery: retry budget exhausted, message failed; awaiting manual resend"
        );
        let _ = self.events.send(DeliveryEvent::MessageFailed(snapshot));
    }

    async fn persist_entry(&self, entry: &OutgoingQueueEntry) -> Result<(), OfflineStoreError> {
        let Some(store) = &self.offline else {
            return Err(OfflineStoreError::new(
                "no local store configured; offline queueing is disabled",
            ));
        };
        let local_id = entry.message.identity.idempotency_key().clone();
        let (key, is_new) = {
            let mut state = self.inner.lock().await;
            match state.outbox_keys.get(&local_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    state.outbox_seq += 1;
                    let key = format!(
                        "{OUTBOX_PREFIX}{}/{:013}-{:06}",
                        entry.message.conversation_id,
                        Utc::now().timestamp_millis(),
                        state.outbox_seq
                    );
                    state.outbox_keys.insert(local_id.clone(), key.clone());
                    (key, true)
                }
            }
        };

        if is_new {
            self.evict_oldest_if_full(store.as_ref()).await;
        }

        let bytes = serde_json::to_vec(entry)
            .map_err(|err| OfflineStoreError::new(format!("entry serialization failed: {err}")))?;
        store
            .put(&key, &bytes)
            .await
            .map_err(|err| OfflineStoreError::new(err.to_string()))?;
        Ok(())
    }

    async fn evict_oldest_if_full(&self, store: &dyn OfflineStore) {
        let existing = match store.list_prefix(OUTBOX_PREFIX).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        if existing.len() >= MAX_OFFLINE_ENTRIES {
            if let Some((oldest_key, _)) = existing.first() {
                warn!(
                    key = %oldest_key,
                    capacity = MAX_OFFLINE_ENTRIES,
                    "delivery: outbox full, evicting oldest entry"
                );
                let _ = store.delete(oldest_key).await;
            }
        }
    }

    async fn remove_offline_entry(&self, local_id: &LocalMessageId) {
        let key = {
            let mut state = self.inner.lock().await;
            state.outbox_keys.remove(local_id)
        };
        let (Some(store), Some(key)) = (&self.offline, key) else {
            return;
        };
        if let Err(err) = store.delete(&key).await {
            warn!(local_id = %local_id, "delivery: failed to delete outbox entry: {err}");
        }
    }

    async fn apply_backend_event(self: &Arc<Self>, conversation_id: &ConversationId, event: BackendEvent) {
        match event {
            BackendEvent::MessageInserted(row) => {
                if let Some(local_id) = row.local_id.clone() {
                    let ours = {
                        let state = self.inner.lock().await;
                        state.ledger.contains_key(&local_id)
                    };
                    if ours {
                        self.apply_confirmation(
                            &local_id,
                            ConfirmedWrite {
                                backend_id: row.backend_id.clone(),
                                created_at: row.created_at,
                            },
                        )
                        .await;
                        self.remove_offline_entry(&local_id).await;
                        return;
                    }
                }
                {
                    let mut state = self.inner.lock().await;
                    state
                        .remote_senders
                        .entry(conversation_id.clone())
                        .or_default()
                        .insert(row.backend_id.clone(), row.sender_id.clone());
                }
                let message = self.message_from_row(row).await;
                let _ = self.events.send(DeliveryEvent::MessageReceived(message));
            }
            BackendEvent::MessageUpdated(row) => {
                if !self
                    .is_original_sender(conversation_id, &row.backend_id, &row.sender_id)
                    .await
                {
                    warn!(
                        backend_id = %row.backend_id,
                        "delivery: ignoring edit from non-sender"
                    );
                    return;
                }
                let message = self.message_from_row(row).await;
                let _ = self.events.send(DeliveryEvent::MessageUpdated(message));
            }
            BackendEvent::MessageDeleted {
                backend_id,
                sender_id,
            } => {
                if !self
                    .is_original_sender(conversation_id, &backend_id, &sender_id)
                    .await
                {
                    warn!(
                        backend_id = %backend_id,
                        "delivery: ignoring delete from non-sender"
                    );
                    return;
                }
                let _ = self.events.send(DeliveryEvent::MessageDeleted {
                    conversation_id: conversation_id.clone(),
                    backend_id,
                });
            }
        }
    }

    /// Deletion/edit overlays apply only when issued by the original
    /// sender. Unknown rows cannot be verified and are ignored.
    async fn is_original_sender(
        &self,
        conversation_id: &ConversationId,
        backend_id: &BackendMessageId,
        actor: &UserId,
    ) -> bool {
        let state = self.inner.lock().await;
        match state
            .remote_senders
            .get(conversation_id)
            .and_then(|senders| senders.get(backend_id))
        {
            Some(sender) => sender == actor,
            None => false,
        }
    }

    async fn message_from_row(&self, row: MessageRow) -> Message {
        let body = match row.body {
            MessageBody::Encrypted { envelope } => {
                let key = self.keys.resolve_key_for_decrypt(&envelope.key_id).await;
                codec::body_from_envelope(&envelope, key.as_ref())
            }
            other => other,
        };
        Message {
            identity: MessageIdentity::Confirmed {
                local_id: row.local_id.unwrap_or_else(LocalMessageId::generate),
                backend_id: row.backend_id,
            },
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            body,
            status: MessageStatus::Sent,
            created_at: row.created_at,
            edited_at: row.edited_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
