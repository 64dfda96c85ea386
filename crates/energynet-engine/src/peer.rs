//! Peer manager (§4.6, component 8): tracks configured peers, dials
//! outbound connections, and binds inbound handshakes to the peer they
//! belong to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use energynet_transport::TcpFrameTransport;
use energynet_wire::SessionParameters;
use tokio::net::TcpStream;
use tokio::sync::RwLock;

use crate::listener::{isolate, NoopNodeListener, NodeListener, PeerSnapshot};
use crate::session::{SessionEngine, SessionHooks, SessionState};
use crate::EngineError;

/// How a peer's connection was established, and which side may dial
/// (§4.6). `Bidirectional` both dials out and accepts an inbound binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Bidirectional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Static configuration for one peer. `host`/`port` are required unless
/// `direction` is `Inbound` (§4.6 invariant: a dialing direction needs
/// somewhere to dial).
#[derive(Clone, Debug, PartialEq)]
pub struct PeerConfig {
    pub peer_id: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub direction: Direction,
    pub expected_identity: Option<String>,
}

impl PeerConfig {
    pub fn resolved_expected_identity(&self) -> &str {
        self.expected_identity.as_deref().unwrap_or(&self.peer_id)
    }
}

struct PeerData {
    config: PeerConfig,
    session_id: Option<String>,
}

pub struct Peer {
    data: RwLock<PeerData>,
    insertion_seq: u64,
}

impl Peer {
    pub async fn config(&self) -> PeerConfig {
        self.data.read().await.config.clone()
    }

    pub async fn connection_state(&self, session_engine: &SessionEngine) -> PeerConnectionState {
        let session_id = self.data.read().await.session_id.clone();
        match session_id {
            None => PeerConnectionState::Disconnected,
            Some(sid) => match session_engine.session_state(&sid).await {
                Some(SessionState::AwaitingSession) => PeerConnectionState::Connecting,
                Some(SessionState::Active) => PeerConnectionState::Connected,
                _ => PeerConnectionState::Disconnected,
            },
        }
    }
}

/// Tracks peers, their session binding, and drives the §4.6 dial/bind
/// rules. Implements [`SessionHooks`] so the session engine can reach back
/// in on handshake and close without depending on this module.
pub struct PeerManager {
    peers: DashMap<String, Arc<Peer>>,
    session_to_peer: DashMap<String, String>,
    session_engine: Arc<SessionEngine>,
    listener: RwLock<Arc<dyn NodeListener>>,
    insertion_counter: AtomicU64,
}

impl PeerManager {
    pub fn new(session_engine: Arc<SessionEngine>) -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
            session_to_peer: DashMap::new(),
            session_engine,
            listener: RwLock::new(Arc::new(NoopNodeListener)),
            insertion_counter: AtomicU64::new(0),
        })
    }

    pub async fn set_listener(&self, listener: Arc<dyn NodeListener>) {
        *self.listener.write().await = listener;
    }

    async fn listener_snapshot(&self) -> Arc<dyn NodeListener> {
        self.listener.read().await.clone()
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|e| e.value().clone())
    }

    pub async fn bound_session_id(&self, peer_id: &str) -> Option<String> {
        let peer = self.get_peer(peer_id)?;
        peer.data.read().await.session_id.clone()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn add_peer(self: &Arc<Self>, config: PeerConfig) -> Result<(), EngineError> {
        if self.peers.contains_key(&config.peer_id) {
            return Err(EngineError::InvalidArgument(format!(
                "peer {} already exists",
                config.peer_id
            )));
        }
        if config.direction != Direction::Inbound && config.host.is_none() {
            return Err(EngineError::InvalidArgument(
                "host is required unless direction is inbound".to_string(),
            ));
        }
        let seq = self.insertion_counter.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(Peer {
            data: RwLock::new(PeerData {
                config: config.clone(),
                session_id: None,
            }),
            insertion_seq: seq,
        });
        self.peers.insert(config.peer_id.clone(), peer.clone());

        if config.direction != Direction::Inbound {
            self.spawn_outbound_dial(peer);
        }
        Ok(())
    }

    pub async fn remove_peer(self: &Arc<Self>, peer_id: &str) -> Result<(), EngineError> {
        let Some((_, peer)) = self.peers.remove(peer_id) else {
            return Err(EngineError::InvalidArgument(format!(
                "peer {peer_id} not found"
            )));
        };
        let session_id = peer.data.read().await.session_id.clone();
        if let Some(sid) = session_id {
            self.session_to_peer.remove(&sid);
            self.session_engine.close_session(&sid).await;
            self.fire_peer_disconnected(&peer).await;
        }
        Ok(())
    }

    fn spawn_outbound_dial(self: &Arc<Self>, peer: Arc<Peer>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let (host, port, peer_id) = {
                let data = peer.data.read().await;
                (
                    data.config.host.clone(),
                    data.config.port.unwrap_or(energynet_transport::DEFAULT_PORT),
                    data.config.peer_id.clone(),
                )
            };
            let Some(host) = host else { return };

            match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    let transport: Box<dyn energynet_transport::FrameTransport> =
                        Box::new(TcpFrameTransport::new(stream));
                    let session = manager
                        .session_engine
                        .accept(transport, manager.clone())
                        .await;

                    // Pre-bind before the handshake completes (§4.6): an
                    // outbound dial already knows which peer this session
                    // belongs to.
                    manager
                        .session_to_peer
                        .insert(session.id.clone(), peer_id);
                    peer.data.write().await.session_id = Some(session.id.clone());
                }
                Err(e) => {
                    tracing::debug!(error = %e, "outbound dial failed, not retrying");
                }
            }
        });
    }

    async fn fire_peer_connected(&self, peer: &Arc<Peer>) {
        let snap = self.snapshot_peer(peer).await;
        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_peer_connected(snap));
    }

    async fn fire_peer_disconnected(&self, peer: &Arc<Peer>) {
        let snap = self.snapshot_peer(peer).await;
        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_peer_disconnected(snap));
    }

    async fn fire_peer_parameters_updated(&self, peer: &Arc<Peer>) {
        let snap = self.snapshot_peer(peer).await;
        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_peer_parameters_updated(snap));
    }

    async fn fire_error(&self, message: String) {
        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_error(message));
    }

    async fn snapshot_peer(&self, peer: &Arc<Peer>) -> PeerSnapshot {
        let config = peer.data.read().await.config.clone();
        let connection_state = peer.connection_state(&self.session_engine).await;
        let session_id = self.bound_session_id(&config.peer_id).await;
        let mut session = None;
        if let Some(sid) = session_id {
            if let Some(s) = self.session_engine.get(&sid) {
                session = Some(s.snapshot().await);
            }
        }
        PeerSnapshot {
            peer_id: config.peer_id,
            direction: config.direction,
            expected_identity: config.resolved_expected_identity().to_string(),
            connection_state,
            session,
            captured_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
impl SessionHooks for PeerManager {
    /// Bind an inbound handshake to the first unbound peer whose expected
    /// identity matches, in insertion order (§4.6, §9 resolved: fixed
    /// insertion-order tie-break, no retry).
    async fn bind_inbound(&self, session_id: &str, remote: &SessionParameters) {
        if self.session_to_peer.contains_key(session_id) {
            // Pre-bound by an outbound dial; that binding wins.
            return;
        }

        let mut candidates: Vec<Arc<Peer>> = self.peers.iter().map(|e| e.value().clone()).collect();
        candidates.sort_by_key(|p| p.insertion_seq);

        for peer in candidates {
            let matched = {
                let mut data = peer.data.write().await;
                let matches = data.config.direction != Direction::Outbound
                    && data.config.resolved_expected_identity() == remote.identity
                    && data.session_id.is_none();
                if matches {
                    data.session_id = Some(session_id.to_string());
                }
                matches
            };
            if matched {
                let peer_id = peer.data.read().await.config.peer_id.clone();
                self.session_to_peer.insert(session_id.to_string(), peer_id);
                self.fire_peer_connected(&peer).await;
                return;
            }
        }
        // No configured peer claims this identity; the session stays
        // unbound and the engine still tracks it.
    }

    /// Relay a bound session's parameter update to `NodeListener::on_peer_parameters_updated`.
    async fn on_parameters_updated(&self, session_id: &str) {
        let Some(peer_id) = self.session_to_peer.get(session_id).map(|e| e.value().clone()) else {
            return;
        };
        let Some(peer) = self.get_peer(&peer_id) else {
            return;
        };
        self.fire_peer_parameters_updated(&peer).await;
    }

    /// Relay a session-ending parse/transport failure to `NodeListener::on_error`.
    async fn on_session_error(&self, session_id: &str, error: String) {
        match self.session_to_peer.get(session_id).map(|e| e.value().clone()) {
            Some(peer_id) => self.fire_error(format!("peer {peer_id}: {error}")).await,
            None => self.fire_error(format!("session {session_id}: {error}")).await,
        }
    }

    async fn on_session_closed(&self, session_id: &str) {
        let Some((_, peer_id)) = self.session_to_peer.remove(session_id) else {
            return;
        };
        let Some(peer) = self.get_peer(&peer_id) else {
            return;
        };
        peer.data.write().await.session_id = None;
        self.fire_peer_disconnected(&peer).await;
    }
}
