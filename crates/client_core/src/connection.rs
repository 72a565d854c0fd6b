//! Per-peer connection state machine and fallback decision.
//!
//! One `ConnectionState` per remote peer, mutated only here under a
//! single-writer discipline: every event (explicit call, transport
//! callback, fallback deadline) applies at most one transition while
//! holding the peer map lock. Deadline tasks capture the state generation
//! at scheduling time and are no-ops once any later transition has bumped
//! it, so a stale timer racing an explicit call can never double-apply.

use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::domain::PeerId;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    scheduler::RetryScheduler,
    transport::{PeerTransport, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
    Fallback,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub attempts: u32,
    pub fallback_active: bool,
    /// Monotonically incremented on every transition; outstanding fallback
    /// timers compare against it and no-op when stale.
    pub generation: u64,
}

impl ConnectionState {
    pub fn disconnected() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            attempts: 0,
            fallback_active: false,
            generation: 0,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub fallback_timeout: Duration,
    /// Connect attempts beyond this count force fallback immediately when
    /// the peer has never been reached.
    pub max_connect_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            fallback_timeout: Duration::from_secs(10),
            max_connect_attempts: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStateChanged {
    pub peer_id: PeerId,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Default)]
struct PeerEntry {
    state: ConnectionState,
    ever_connected: bool,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn PeerTransport>,
    scheduler: Arc<dyn RetryScheduler>,
    config: SupervisorConfig,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    events: broadcast::Sender<ConnectionStateChanged>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        scheduler: Arc<dyn RetryScheduler>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            transport,
            scheduler,
            config,
            peers: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<ConnectionStateChanged> {
        self.events.subscribe()
    }

    pub async fn state(&self, peer_id: &PeerId) -> ConnectionState {
        let peers = self.peers.lock().await;
        peers
            .get(peer_id)
            .map(|entry| entry.state.clone())
            .unwrap_or_else(ConnectionState::disconnected)
    }

    /// Starts a connection attempt. Enters `Connecting` and arms the
    /// fallback deadline, or forces `Fallback` outright once the attempt
    /// budget for a never-reached peer is spent. The transport attempt is
    /// started either way; a late success still promotes to `Connected`.
    pub async fn connect(self: &Arc<Self>, peer_id: PeerId) {
        let deadline_generation = {
            let mut peers = self.peers.lock().await;
            let entry = peers.entry(peer_id.clone()).or_default();
            if entry.state.phase == ConnectionPhase::Closed {
                *entry = PeerEntry::default();
            }
            if entry.state.phase == ConnectionPhase::Connected {
                return;
            }
            entry.state.attempts += 1;
            entry.state.generation += 1;
            if entry.state.attempts > self.config.max_connect_attempts && !entry.ever_connected {
                entry.state.phase = ConnectionPhase::Fallback;
                entry.state.fallback_active = true;
                warn!(
                    peer_id = %peer_id,
                    attempts = entry.state.attempts,
                    "connection: attempt budget spent, forcing fallback"
                );
                self.emit(&peer_id, &entry.state);
                None
            } else {
                entry.state.phase = ConnectionPhase::Connecting;
                info!(
                    peer_id = %peer_id,
                    attempt = entry.state.attempts,
                    "connection: entering connecting"
                );
                self.emit(&peer_id, &entry.state);
                Some(entry.state.generation)
            }
        };

        self.spawn_transport_attempt(peer_id.clone());

        if let Some(generation) = deadline_generation {
            let supervisor = Arc::clone(self);
            let timeout = self.config.fallback_timeout;
            tokio::spawn(async move {
                supervisor.scheduler.delay(timeout).await;
                supervisor.on_fallback_deadline(&peer_id, generation).await;
            });
        }
    }

    /// Invalidates any outstanding fallback timer, resets the attempt
    /// counter and re-enters `Connecting`.
    pub async fn reconnect(self: &Arc<Self>, peer_id: PeerId) {
        {
            let mut peers = self.peers.lock().await;
            let entry = peers.entry(peer_id.clone()).or_default();
            entry.state.generation += 1;
            entry.state.attempts = 0;
        }
        self.connect(peer_id).await;
    }

    /// Terminal until the next `connect`. Explicit closes are the only way
    /// to reach `Closed`; transport failures never are.
    pub async fn close(&self, peer_id: &PeerId) {
        let mut peers = self.peers.lock().await;
        let entry = peers.entry(peer_id.clone()).or_default();
        entry.state.phase = ConnectionPhase::Closed;
        entry.state.fallback_active = false;
        entry.state.generation += 1;
        info!(peer_id = %peer_id, "connection: closed");
        self.emit(peer_id, &entry.state);
    }

    /// Sends a payload over the established peer link. A send failure is
    /// treated like any other transport failure and engages fallback.
    pub async fn send_to_peer(
        &self,
        peer_id: &PeerId,
        bytes: Vec<u8>,
    ) -> Result<(), crate::error::ConnectionError> {
        match self.transport.send(peer_id, bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.handle_transport_failure(peer_id).await;
                Err(err)
            }
        }
    }

    /// Transport reports the peer link is up. Idempotent when already
    /// `Connected`; a late success while in `Fallback` still promotes and
    /// clears `fallback_active`.
    pub async fn handle_transport_connected(&self, peer_id: &PeerId) {
        let mut peers = self.peers.lock().await;
        let Some(entry) = peers.get_mut(peer_id) else {
            return;
        };
        match entry.state.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Fallback => {
                entry.state.phase = ConnectionPhase::Connected;
                entry.state.fallback_active = false;
                entry.state.generation += 1;
                entry.ever_connected = true;
                info!(peer_id = %peer_id, "connection: peer link established");
                self.emit(peer_id, &entry.state);
            }
            ConnectionPhase::Connected => {}
            ConnectionPhase::Idle | ConnectionPhase::Closed => {
                warn!(peer_id = %peer_id, "connection: ignoring stale transport success");
            }
        }
    }

    /// Transport reports a negotiation failure or a dropped link. Only ever
    /// drives toward `Fallback`.
    pub async fn handle_transport_failure(&self, peer_id: &PeerId) {
        let mut peers = self.peers.lock().await;
        let Some(entry) = peers.get_mut(peer_id) else {
            return;
        };
        match entry.state.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Connected => {
                entry.state.phase = ConnectionPhase::Fallback;
                entry.state.fallback_active = true;
                entry.state.generation += 1;
                info!(peer_id = %peer_id, "connection: transport failure, engaging fallback");
                self.emit(peer_id, &entry.state);
            }
            ConnectionPhase::Idle | ConnectionPhase::Fallback | ConnectionPhase::Closed => {}
        }
    }

    async fn on_fallback_deadline(&self, peer_id: &PeerId, generation: u64) {
        let mut peers = self.peers.lock().await;
        let Some(entry) = peers.get_mut(peer_id) else {
            return;
        };
        if entry.state.generation != generation {
            // A transition (success, reconnect, close) got there first.
            return;
        }
        if entry.state.phase == ConnectionPhase::Connecting {
            entry.state.phase = ConnectionPhase::Fallback;
            entry.state.fallback_active = true;
            entry.state.generation += 1;
            info!(
                peer_id = %peer_id,
                timeout_ms = self.config.fallback_timeout.as_millis() as u64,
                "connection: fallback deadline elapsed"
            );
            self.emit(peer_id, &entry.state);
        }
    }

    /// Routes transport callbacks into the state machine.
    pub fn spawn_transport_event_task(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut events = self.transport.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    TransportEvent::ConnectionStateChanged {
                        peer_id,
                        connected: true,
                    } => supervisor.handle_transport_connected(&peer_id).await,
                    TransportEvent::ConnectionStateChanged {
                        peer_id,
                        connected: false,
                    } => supervisor.handle_transport_failure(&peer_id).await,
                    TransportEvent::DataChannelStateChanged {
                        peer_id,
                        open: false,
                    } => supervisor.handle_transport_failure(&peer_id).await,
                    TransportEvent::DataChannelStateChanged { .. } => {}
                    // Inbound payloads belong to the ingestion side, which
                    // subscribes to the transport directly.
                    TransportEvent::InboundData { .. } => {}
                }
            }
        })
    }

    fn spawn_transport_attempt(self: &Arc<Self>, peer_id: PeerId) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = supervisor.transport.connect(&peer_id).await {
                warn!(peer_id = %peer_id, "connection: transport connect failed: {err}");
                supervisor.handle_transport_failure(&peer_id).await;
            }
        });
    }

    fn emit(&self, peer_id: &PeerId, state: &ConnectionState) {
        let _ = self.events.send(ConnectionStateChanged {
            peer_id: peer_id.clone(),
            state: state.clone(),
        });
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
