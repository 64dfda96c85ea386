//! The `Node` facade (§4.8, component 10): composes the session engine,
//! peer manager, transfer engine, and an optional inbound acceptor behind
//! one public API.

use std::sync::Arc;
use std::time::Duration;

use energynet_engine::{
    NodeListener, Peer, PeerConfig, PeerManager, PeerSnapshot, ServerListener, SessionEngine,
    StartTransferResult, TransferEngine, TransferParams,
};
use energynet_transport::{FrameTransport, TcpFrameTransport, DEFAULT_PORT};
use energynet_wire::SessionParameters;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, RwLock};

/// `Node::new`'s config argument (§6).
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub identity: SessionParameters,
    pub listen_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error(transparent)]
    Engine(#[from] energynet_engine::EngineError),
}

/// Forwards peer events to the user's [`NodeListener`] and additionally
/// stops any in-flight transfer when a peer disconnects (§4.7 "forced
/// stops"), decoupling the transfer engine from the peer manager.
struct CompositeListener {
    user: RwLock<Arc<dyn NodeListener>>,
    transfer_engine: RwLock<Option<Arc<TransferEngine>>>,
}

struct NoopUserListener;
impl NodeListener for NoopUserListener {}

impl CompositeListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            user: RwLock::new(Arc::new(NoopUserListener)),
            transfer_engine: RwLock::new(None),
        })
    }
}

impl NodeListener for CompositeListener {
    fn on_peer_connected(&self, peer: PeerSnapshot) {
        let user = self.user.try_read().map(|g| g.clone()).ok();
        if let Some(user) = user {
            user.on_peer_connected(peer);
        }
    }

    fn on_peer_disconnected(&self, peer: PeerSnapshot) {
        if let Ok(transfer_engine) = self.transfer_engine.try_read() {
            if let Some(transfer_engine) = transfer_engine.clone() {
                let peer_id = peer.peer_id.clone();
                tokio::spawn(async move {
                    let _ = transfer_engine.stop_transfer(&peer_id).await;
                });
            }
        }
        if let Ok(user) = self.user.try_read() {
            user.on_peer_disconnected(peer);
        }
    }

    fn on_peer_parameters_updated(&self, peer: PeerSnapshot) {
        if let Ok(user) = self.user.try_read() {
            user.on_peer_parameters_updated(peer);
        }
    }

    fn on_transfer_started(&self, peer_id: String) {
        if let Ok(user) = self.user.try_read() {
            user.on_transfer_started(peer_id);
        }
    }

    fn on_transfer_stopped(&self, peer_id: String) {
        if let Ok(user) = self.user.try_read() {
            user.on_transfer_stopped(peer_id);
        }
    }

    fn on_error(&self, message: String) {
        if let Ok(user) = self.user.try_read() {
            user.on_error(message);
        }
    }

    fn on_message_sent(&self, peer_id: String, type_id: u32) {
        if let Ok(user) = self.user.try_read() {
            user.on_message_sent(peer_id, type_id);
        }
    }
}

struct Acceptor {
    join: tokio::task::JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// Composes components 7-10 behind the public surface from §6.
pub struct Node {
    config: NodeConfig,
    session_engine: Arc<SessionEngine>,
    peer_manager: Arc<PeerManager>,
    transfer_engine: Arc<TransferEngine>,
    composite: Arc<CompositeListener>,
    acceptor: Mutex<Option<Acceptor>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let session_engine = SessionEngine::new(config.identity.clone());
        let peer_manager = PeerManager::new(session_engine.clone());
        let transfer_engine = TransferEngine::new(peer_manager.clone(), session_engine.clone());

        let composite = CompositeListener::new();
        // Populated synchronously here: no other task can observe the
        // engine before `Node::new` returns, so the lock is uncontended.
        if let Ok(mut slot) = composite.transfer_engine.try_write() {
            *slot = Some(transfer_engine.clone());
        }

        Self {
            config,
            session_engine,
            peer_manager,
            transfer_engine,
            composite,
            acceptor: Mutex::new(None),
        }
    }

    pub async fn set_listener(&self, listener: Arc<dyn NodeListener>) {
        *self.composite.user.write().await = listener;
        self.peer_manager.set_listener(self.composite.clone()).await;
        self.transfer_engine.set_listener(self.composite.clone()).await;
    }

    pub async fn set_server_listener(&self, listener: Arc<dyn ServerListener>) {
        self.session_engine.set_listener(listener).await;
    }

    /// Binds the listen port if configured (§4.8).
    pub async fn start(&self) -> Result<(), NodeError> {
        let port = self.config.listen_port.unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Ok(());
        }
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NodeError::Io(e.to_string()))?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let session_engine = self.session_engine.clone();
        let peer_manager = self.peer_manager.clone();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let transport: Box<dyn FrameTransport> =
                                    Box::new(TcpFrameTransport::new(stream));
                                session_engine.accept(transport, peer_manager.clone()).await;
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "inbound accept failed");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        *self.acceptor.lock().await = Some(Acceptor {
            join,
            shutdown: shutdown_tx,
        });
        Ok(())
    }

    /// Cancels the transfer scope, then the acceptor, then the session
    /// engine (§4.8, §5: in that order, so STOPPED callbacks still
    /// observe a live session).
    pub async fn close(&self) {
        self.transfer_engine.stop_all().await;

        if let Some(acceptor) = self.acceptor.lock().await.take() {
            let _ = acceptor.shutdown.send(());
            let _ = acceptor.join.await;
        }

        self.session_engine.close_all().await;
    }

    pub async fn add_peer(&self, config: PeerConfig) -> Result<(), NodeError> {
        self.peer_manager.add_peer(config).await?;
        Ok(())
    }

    pub async fn remove_peer(&self, peer_id: &str) -> Result<(), NodeError> {
        self.peer_manager.remove_peer(peer_id).await?;
        Ok(())
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peer_manager.peers()
    }

    pub async fn start_transfer(
        &self,
        peer_id: &str,
        params: TransferParams,
        tick_rate: Option<Duration>,
    ) -> StartTransferResult {
        self.transfer_engine
            .start_transfer(peer_id, params, tick_rate.unwrap_or(Duration::from_millis(100)))
            .await
    }

    pub async fn update_transfer(&self, peer_id: &str, params: TransferParams) -> Result<(), NodeError> {
        self.transfer_engine.update_transfer(peer_id, params).await?;
        Ok(())
    }

    pub async fn stop_transfer(&self, peer_id: &str) -> Result<(), NodeError> {
        self.transfer_engine.stop_transfer(peer_id).await?;
        Ok(())
    }
}

pub const DEFAULT_LISTEN_PORT: u16 = DEFAULT_PORT;

#[cfg(test)]
mod tests {
    use super::*;
    use energynet_engine::Direction;
    use energynet_wire::{Message, ParseMode};
    use tokio::net::TcpStream;

    fn identity(name: &str) -> SessionParameters {
        SessionParameters {
            identity: name.to_string(),
            r#type: None,
            version: None,
            name: None,
            tenant: None,
            provider: None,
            session: None,
        }
    }

    #[tokio::test]
    async fn start_accepts_inbound_connections_bound_to_a_configured_peer() {
        // Port 0 means "don't listen" at the Node level; bind a concrete
        // ephemeral port first so the test can connect to a known address.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let node = Node::new(NodeConfig {
            identity: identity("node-a"),
            listen_port: Some(addr.port()),
        });
        node.add_peer(PeerConfig {
            peer_id: "p1".to_string(),
            host: None,
            port: None,
            direction: Direction::Inbound,
            expected_identity: Some("node-b".to_string()),
        })
        .await
        .expect("add peer");
        node.start().await.expect("start");

        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut remote =
            energynet_transport::MessageTransport::new(TcpFrameTransport::new(stream), ParseMode::Lenient);
        remote
            .send(&Message::SessionParameters(identity("node-b")))
            .await
            .expect("send session parameters");
        let reply = remote.recv().await.expect("recv").expect("reply");
        assert!(matches!(reply.message, Message::SessionParameters(_)));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let peers = node.peers();
        assert_eq!(peers.len(), 1);

        node.close().await;
    }

    #[tokio::test]
    async fn add_peer_rejects_duplicate_peer_id() {
        let node = Node::new(NodeConfig {
            identity: identity("node-a"),
            listen_port: Some(0),
        });
        let config = PeerConfig {
            peer_id: "p1".to_string(),
            host: None,
            port: None,
            direction: Direction::Inbound,
            expected_identity: Some("node-b".to_string()),
        };
        node.add_peer(config.clone()).await.expect("first add");
        let result = node.add_peer(config).await;
        assert!(result.is_err());
        node.close().await;
    }
}
