//! Connectivity observer.
//!
//! Thin collaborator: something platform-specific reports online/offline
//! transitions into it, and the delivery queue watches the flag to flush
//! its offline outbox on every offline→online edge.

use tokio::sync::watch;
use tracing::info;

pub struct NetworkObserver {
    tx: watch::Sender<bool>,
}

impl NetworkObserver {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn set_online(&self) {
        if !self.tx.send_replace(true) {
            info!("network: connectivity restored");
        }
    }

    pub fn set_offline(&self) {
        if self.tx.send_replace(false) {
            info!("network: connectivity lost");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
