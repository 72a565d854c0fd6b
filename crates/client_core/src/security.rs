//! Effective security-level resolution.
//!
//! Pure and allocation-free; called on every send and on every connection
//! state change that the UI indicator cares about.

use shared::protocol::{ConfiguredSecurity, SecurityLevel};

use crate::connection::{ConnectionPhase, ConnectionState};

/// Maps the configured policy and the current connection state to the
/// security level actually in force.
///
/// Peer encryption requires a live, non-fallback peer link. Everything else
/// that permits encryption rides the relay: a peer-preferred conversation
/// currently in fallback and a relay-only conversation resolve identically.
pub fn resolve(configured: ConfiguredSecurity, state: &ConnectionState) -> SecurityLevel {
    if configured.permits_peer()
        && state.phase == ConnectionPhase::Connected
        && !state.fallback_active
    {
        SecurityLevel::PeerEncrypted
    } else if configured.permits_encrypted_relay() {
        SecurityLevel::RelayEncrypted
    } else {
        SecurityLevel::Standard
    }
}

#[cfg(test)]
#[path = "tests/security_tests.rs"]
mod tests;
