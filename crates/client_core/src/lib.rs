//! Client-side secure transport and key lifecycle.
//!
//! Supervises peer connections with relay fallback, resolves the
//! effective security level per conversation, manages session keys
//! (creation races, rotation, history), seals message bodies in a
//! versioned encryption envelope, and delivers outgoing messages with
//! offline persistence and bounded retries.

pub mod backend;
pub mod codec;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod network;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
#[path = "tests/testutil.rs"]
pub(crate) mod testutil;

pub use backend::MessageBackend;
pub use connection::{ConnectionPhase, ConnectionState, ConnectionSupervisor, SupervisorConfig};
pub use delivery::{ConversationConfig, DeliveryEvent, DeliveryQueue, RetryPolicy};
pub use keys::{KeyManager, SessionKey};
pub use network::NetworkObserver;
pub use scheduler::{RetryScheduler, TokioScheduler};
pub use session::SessionContext;
pub use store::OfflineStore;
pub use transport::{PeerTransport, TransportEvent};
