//! Transfer engine (§4.7, component 10): periodic ticks that push a peer's
//! current Supply/Demand/Storage parameters over its session, until the
//! caller stops the transfer or the peer disconnects.
//!
//! `TransferParams` is swapped as a whole `Arc` behind an `RwLock` rather
//! than updated field-by-field, approximating the design notes' "single
//! atomic store, no locks required" (§9) — this workspace has no
//! arc-swap-style lock-free cell, so a short-held read/write lock around a
//! pointer replace is the closest available primitive; see `DESIGN.md`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use energynet_wire::{DemandParameters, Message, StorageParameters, SupplyParameters};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::listener::{isolate, NoopNodeListener, NodeListener};
use crate::peer::{PeerConnectionState, PeerManager};
use crate::session::{SessionEngine, SessionState};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransferParams {
    pub supply: Option<SupplyParameters>,
    pub demand: Option<DemandParameters>,
    pub storage: Option<StorageParameters>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Stopped,
}

pub struct EnergyTransfer {
    pub peer_id: String,
    params: RwLock<Arc<TransferParams>>,
    state: RwLock<TransferState>,
    stop_tx: mpsc::Sender<()>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EnergyTransfer {
    pub async fn params(&self) -> Arc<TransferParams> {
        self.params.read().await.clone()
    }

    pub async fn state(&self) -> TransferState {
        *self.state.read().await
    }

    pub async fn update(&self, params: TransferParams) {
        *self.params.write().await = Arc::new(params);
    }

    async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }
}

/// Outcome of [`TransferEngine::start_transfer`] (§4.7's validation order:
/// peer existence, then connectivity, then an already-active transfer).
pub enum StartTransferResult {
    Success(Arc<EnergyTransfer>),
    PeerNotFound(String),
    PeerNotConnected(String, PeerConnectionState),
    TransferAlreadyActive(String),
}

pub struct TransferEngine {
    transfers: DashMap<String, Arc<EnergyTransfer>>,
    peer_manager: Arc<PeerManager>,
    session_engine: Arc<SessionEngine>,
    listener: RwLock<Arc<dyn NodeListener>>,
}

impl TransferEngine {
    pub fn new(peer_manager: Arc<PeerManager>, session_engine: Arc<SessionEngine>) -> Arc<Self> {
        Arc::new(Self {
            transfers: DashMap::new(),
            peer_manager,
            session_engine,
            listener: RwLock::new(Arc::new(NoopNodeListener)),
        })
    }

    pub async fn set_listener(&self, listener: Arc<dyn NodeListener>) {
        *self.listener.write().await = listener;
    }

    async fn listener_snapshot(&self) -> Arc<dyn NodeListener> {
        self.listener.read().await.clone()
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<EnergyTransfer>> {
        self.transfers.get(peer_id).map(|e| e.value().clone())
    }

    pub async fn start_transfer(
        self: &Arc<Self>,
        peer_id: &str,
        params: TransferParams,
        tick_rate: Duration,
    ) -> StartTransferResult {
        let Some(peer) = self.peer_manager.get_peer(peer_id) else {
            return StartTransferResult::PeerNotFound(peer_id.to_string());
        };
        let connection_state = peer.connection_state(&self.session_engine).await;
        if connection_state != PeerConnectionState::Connected {
            return StartTransferResult::PeerNotConnected(peer_id.to_string(), connection_state);
        }
        if self.transfers.contains_key(peer_id) {
            return StartTransferResult::TransferAlreadyActive(peer_id.to_string());
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let transfer = Arc::new(EnergyTransfer {
            peer_id: peer_id.to_string(),
            params: RwLock::new(Arc::new(params)),
            state: RwLock::new(TransferState::Active),
            stop_tx,
            handle: Mutex::new(None),
        });
        self.transfers.insert(peer_id.to_string(), transfer.clone());

        let engine = self.clone();
        let running = transfer.clone();
        let join_handle = tokio::spawn(async move {
            engine.run_tick_loop(running, tick_rate, stop_rx).await;
        });
        *transfer.handle.lock().await = Some(join_handle);

        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_transfer_started(peer_id.to_string()));

        StartTransferResult::Success(transfer)
    }

    pub async fn update_transfer(&self, peer_id: &str, params: TransferParams) -> Result<(), crate::EngineError> {
        match self.transfers.get(peer_id) {
            Some(t) => {
                t.update(params).await;
                Ok(())
            }
            None => Err(crate::EngineError::InvalidArgument(format!(
                "no active transfer for peer {peer_id}"
            ))),
        }
    }

    pub async fn stop_transfer(&self, peer_id: &str) -> Result<(), crate::EngineError> {
        match self.transfers.get(peer_id).map(|e| e.value().clone()) {
            Some(t) => {
                t.stop().await;
                Ok(())
            }
            None => Err(crate::EngineError::InvalidArgument(format!(
                "no active transfer for peer {peer_id}"
            ))),
        }
    }

    /// Stop every active transfer and wait for their tick tasks to finish
    /// (§4.8/§5: the transfer scope is cancelled, and its STOPPED
    /// callbacks run, before the session scope is closed).
    pub async fn stop_all(&self) {
        let transfers: Vec<Arc<EnergyTransfer>> = self.transfers.iter().map(|e| e.value().clone()).collect();
        for t in &transfers {
            t.stop().await;
        }
        for t in transfers {
            let handle = t.handle.lock().await.take();
            if let Some(h) = handle {
                let _ = h.await;
            }
        }
    }

    async fn run_tick_loop(
        self: Arc<Self>,
        transfer: Arc<EnergyTransfer>,
        tick_rate: Duration,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        loop {
            if self.peer_manager.get_peer(&transfer.peer_id).is_none() {
                break;
            }
            let Some(session_id) = self.peer_manager.bound_session_id(&transfer.peer_id).await else {
                break;
            };
            let Some(session) = self.session_engine.get(&session_id) else {
                break;
            };
            if session.state().await != SessionState::Active {
                break;
            }

            let params = transfer.params().await;
            let mut send_failed = false;
            let listener = self.listener_snapshot().await;

            if let Some(ref supply) = params.supply {
                let msg = Message::SupplyParameters(supply.clone());
                let type_id = msg.type_id();
                if session.send(msg).await.is_err() {
                    send_failed = true;
                } else {
                    let peer_id = transfer.peer_id.clone();
                    isolate(|| listener.on_message_sent(peer_id, type_id));
                }
            }
            if !send_failed {
                if let Some(ref demand) = params.demand {
                    let msg = Message::DemandParameters(demand.clone());
                    let type_id = msg.type_id();
                    if session.send(msg).await.is_err() {
                        send_failed = true;
                    } else {
                        let peer_id = transfer.peer_id.clone();
                        isolate(|| listener.on_message_sent(peer_id, type_id));
                    }
                }
            }
            if !send_failed {
                if let Some(ref storage) = params.storage {
                    let msg = Message::StorageParameters(storage.clone());
                    let type_id = msg.type_id();
                    if session.send(msg).await.is_err() {
                        send_failed = true;
                    } else {
                        let peer_id = transfer.peer_id.clone();
                        isolate(|| listener.on_message_sent(peer_id, type_id));
                    }
                }
            }
            if send_failed {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(tick_rate) => {}
                _ = stop_rx.recv() => break,
            }
        }

        *transfer.state.write().await = TransferState::Stopped;
        self.transfers.remove(&transfer.peer_id);
        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_transfer_stopped(transfer.peer_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use energynet_transport::{MessageTransport, TcpFrameTransport};
    use energynet_wire::{ParseMode, SessionParameters};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

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

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (server, _) = listener.accept().await.expect("accept");
        let client = client.await.expect("join").expect("connect");
        (client, server)
    }

    #[derive(Default)]
    struct RecordingListener {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl NodeListener for RecordingListener {
        fn on_transfer_started(&self, _peer_id: String) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_transfer_stopped(&self, _peer_id: String) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn active_peer_pair() -> (
        Arc<SessionEngine>,
        Arc<PeerManager>,
        MessageTransport<TcpFrameTransport>,
    ) {
        let (client, server) = connected_pair().await;
        let session_engine = SessionEngine::new(identity("node-a"));
        let peer_manager = PeerManager::new(session_engine.clone());

        peer_manager
            .add_peer(crate::peer::PeerConfig {
                peer_id: "p1".into(),
                host: None,
                port: None,
                direction: crate::peer::Direction::Inbound,
                expected_identity: Some("node-b".into()),
            })
            .await
            .expect("add peer");

        let _session = session_engine
            .accept(Box::new(TcpFrameTransport::new(server)), peer_manager.clone())
            .await;

        let mut remote = MessageTransport::new(TcpFrameTransport::new(client), ParseMode::Lenient);
        remote
            .send(&Message::SessionParameters(identity("node-b")))
            .await
            .expect("send session parameters");
        let _reply = remote.recv().await.expect("recv").expect("reply");

        (session_engine, peer_manager, remote)
    }

    #[tokio::test]
    async fn start_transfer_fails_for_unknown_peer() {
        let session_engine = SessionEngine::new(identity("node-a"));
        let peer_manager = PeerManager::new(session_engine.clone());
        let transfer_engine = TransferEngine::new(peer_manager, session_engine);

        let result = transfer_engine
            .start_transfer("missing", TransferParams::default(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, StartTransferResult::PeerNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn start_transfer_ticks_immediately_and_on_interval() {
        let (session_engine, peer_manager, mut remote) = active_peer_pair().await;
        let transfer_engine = TransferEngine::new(peer_manager.clone(), session_engine.clone());
        let listener = Arc::new(RecordingListener::default());
        transfer_engine.set_listener(listener.clone()).await;

        let tick_rate = Duration::from_millis(30);
        let params = TransferParams {
            supply: Some(SupplyParameters {
                power_limit: Some(1000.0),
                ..Default::default()
            }),
            demand: None,
            storage: None,
        };

        let result = transfer_engine.start_transfer("p1", params, tick_rate).await;
        assert!(matches!(result, StartTransferResult::Success(_)));
        assert_eq!(listener.started.load(Ordering::SeqCst), 1);

        // First tick fires with no initial sleep.
        let first = remote.recv().await.expect("recv").expect("first tick");
        assert!(matches!(first.message, Message::SupplyParameters(_)));

        // Advance virtual time past one full tick interval instead of
        // sleeping in wall-clock time.
        tokio::time::advance(tick_rate + Duration::from_millis(1)).await;
        let second = remote.recv().await.expect("recv").expect("second tick");
        assert!(matches!(second.message, Message::SupplyParameters(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_transfer_ends_the_tick_loop() {
        let (session_engine, peer_manager, mut remote) = active_peer_pair().await;
        let transfer_engine = TransferEngine::new(peer_manager.clone(), session_engine.clone());
        let listener = Arc::new(RecordingListener::default());
        transfer_engine.set_listener(listener.clone()).await;

        let params = TransferParams {
            supply: Some(SupplyParameters {
                power_limit: Some(500.0),
                ..Default::default()
            }),
            demand: None,
            storage: None,
        };
        transfer_engine
            .start_transfer("p1", params, Duration::from_millis(500))
            .await;

        let _first = remote.recv().await.expect("recv").expect("first tick");
        transfer_engine.stop_transfer("p1").await.expect("stop");

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(listener.stopped.load(Ordering::SeqCst), 1);
        assert!(transfer_engine.get("p1").is_none());
    }
}
