//! Observer snapshots and listener traits (§4.8, component 9).
//!
//! Snapshots are plain data, captured at the moment a callback fires, so
//! a listener can never observe a session or peer mutating underneath it.

use chrono::{DateTime, Utc};
use energynet_wire::{DemandParameters, SessionParameters, StorageParameters, SupplyParameters};

use crate::peer::{Direction, PeerConnectionState};
use crate::session::SessionState;

/// Immutable view of a [`crate::session::DeviceSession`] at the instant it
/// was captured.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSessionSnapshot {
    pub id: String,
    pub state: SessionState,
    pub remote: Option<SessionParameters>,
    pub latest_supply: Option<SupplyParameters>,
    pub latest_demand: Option<DemandParameters>,
    pub latest_storage: Option<StorageParameters>,
    pub captured_at: DateTime<Utc>,
}

/// Immutable view of a [`crate::peer::Peer`] at the instant it was captured.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub direction: Direction,
    pub expected_identity: String,
    pub connection_state: PeerConnectionState,
    pub session: Option<DeviceSessionSnapshot>,
    pub captured_at: DateTime<Utc>,
}

/// Low-level, per-session callbacks (§4.8). Default bodies are no-ops so
/// implementors only override what they care about.
pub trait ServerListener: Send + Sync {
    fn on_session_created(&self, _session: DeviceSessionSnapshot) {}
    fn on_session_active(&self, _session: DeviceSessionSnapshot) {}
    fn on_session_handshake_failed(&self, _session: DeviceSessionSnapshot, _reason: String) {}
    fn on_session_disconnecting(&self, _session: DeviceSessionSnapshot) {}
    fn on_session_closed(&self, _session: DeviceSessionSnapshot) {}
    fn on_message_received(&self, _session: DeviceSessionSnapshot) {}
    fn on_session_error(&self, _session: DeviceSessionSnapshot, _error: String) {}
}

/// High-level, peer-focused callbacks (§4.8).
pub trait NodeListener: Send + Sync {
    fn on_peer_connected(&self, _peer: PeerSnapshot) {}
    fn on_peer_disconnected(&self, _peer: PeerSnapshot) {}
    fn on_peer_parameters_updated(&self, _peer: PeerSnapshot) {}
    fn on_transfer_started(&self, _peer_id: String) {}
    fn on_transfer_stopped(&self, _peer_id: String) {}
    fn on_error(&self, _message: String) {}
    fn on_message_sent(&self, _peer_id: String, _type_id: u32) {}
}

pub(crate) struct NoopServerListener;
impl ServerListener for NoopServerListener {}

pub(crate) struct NoopNodeListener;
impl NodeListener for NoopNodeListener {}

/// Runs a listener callback in isolation: a panicking listener must not
/// take down the session or tick task that invoked it (§4.5, §7).
pub(crate) fn isolate<F: FnOnce()>(f: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::warn!("listener callback panicked; ignoring");
    }
}
