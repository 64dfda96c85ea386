//! Session state machine, peer manager, and transfer engine for the
//! EnergyNet Protocol node core (components 7-10).

pub mod listener;
pub mod peer;
pub mod session;
pub mod transfer;

pub use listener::{DeviceSessionSnapshot, NodeListener, PeerSnapshot, ServerListener};
pub use peer::{Direction, Peer, PeerConfig, PeerConnectionState, PeerManager};
pub use session::{DeviceSession, SessionEngine, SessionHooks, SessionState};
pub use transfer::{EnergyTransfer, StartTransferResult, TransferEngine, TransferParams, TransferState};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
