//! Injectable delay service for fallback and retry timing.
//!
//! Connection fallback deadlines and queue backoff both sleep through this
//! trait, so tests drive them deterministically with tokio's paused clock
//! instead of wall-clock waits. Cancellation is handled by the callers:
//! supervisor timers carry a generation token and are no-ops when stale,
//! queue lane tasks are aborted outright.

use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait RetryScheduler: Send + Sync {
    async fn delay(&self, duration: Duration);
}

pub struct TokioScheduler;

#[async_trait]
impl RetryScheduler for TokioScheduler {
    async fn delay(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
