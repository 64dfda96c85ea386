//! Session state machine (§4.5, component 7).
//!
//! A [`DeviceSession`] exclusively owns its transport (§5): the transport
//! is moved into the session's task on [`SessionEngine::accept`] and never
//! touched from outside it again. External callers — [`disconnect`] and the
//! transfer engine's tick loop — reach it only through [`DeviceSession::send`],
//! which hands the message to the task over a channel and awaits the send
//! result, so every byte written to the socket is serialized through one
//! place.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use energynet_transport::{FrameTransport, MessageTransport, TransportError, TransportResult};
use energynet_wire::{
    Message, ParseMode, ParseOutcome, SessionParameters, SoftDisconnect,
};
use energynet_wire::{DemandParameters, StorageParameters, SupplyParameters};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::listener::{isolate, DeviceSessionSnapshot, NoopServerListener, ServerListener};

/// §4.5's four states. `AWAITING_SESSION` is the only state a session can
/// be created in; `CLOSED` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingSession,
    Active,
    Disconnecting,
    Closed,
}

/// Hooks the peer manager implements so the session engine can bind an
/// inbound handshake to a peer, react to parameter updates and errors, and
/// clean up its index on close, without the session engine depending on
/// `peer.rs` directly.
#[async_trait::async_trait]
pub trait SessionHooks: Send + Sync {
    async fn bind_inbound(&self, session_id: &str, remote: &SessionParameters);
    /// Fired whenever an Active session's latest Supply/Demand/Storage
    /// parameters change, so the peer manager can raise
    /// `NodeListener::on_peer_parameters_updated` for the bound peer.
    async fn on_parameters_updated(&self, session_id: &str);
    /// Fired on a parse or transport failure that ends the session, so the
    /// peer manager can raise `NodeListener::on_error`.
    async fn on_session_error(&self, session_id: &str, error: String);
    async fn on_session_closed(&self, session_id: &str);
}

struct SessionData {
    state: SessionState,
    remote: Option<SessionParameters>,
    latest_supply: Option<SupplyParameters>,
    latest_demand: Option<DemandParameters>,
    latest_storage: Option<StorageParameters>,
}

enum SessionCommand {
    Disconnect(Option<String>),
    Close,
    Send(Message, oneshot::Sender<TransportResult<()>>),
}

/// A single EnergyNet session (§3). Reference-counted: the engine's table
/// and peer bindings share ownership.
pub struct DeviceSession {
    pub id: String,
    data: RwLock<SessionData>,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl DeviceSession {
    pub async fn state(&self) -> SessionState {
        self.data.read().await.state
    }

    pub async fn snapshot(&self) -> DeviceSessionSnapshot {
        let data = self.data.read().await;
        DeviceSessionSnapshot {
            id: self.id.clone(),
            state: data.state,
            remote: data.remote.clone(),
            latest_supply: data.latest_supply.clone(),
            latest_demand: data.latest_demand.clone(),
            latest_storage: data.latest_storage.clone(),
            captured_at: Utc::now(),
        }
    }

    /// Send a message through the session's owning task. Fails with
    /// [`TransportError::Closed`] if the session has already finished.
    pub async fn send(&self, message: Message) -> TransportResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Send(message, tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

fn generate_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(bytes.len() * 2 + 5);
    hex.push_str("sess-");
    for b in bytes {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

fn message_type_name(message: &Message) -> &'static str {
    match message {
        Message::Ping => "Ping",
        Message::SessionParameters(_) => "SessionParameters",
        Message::SoftDisconnect(_) => "SoftDisconnect",
        Message::SupplyParameters(_) => "SupplyParameters",
        Message::DemandParameters(_) => "DemandParameters",
        Message::StorageParameters(_) => "StorageParameters",
        Message::UnknownMessage { .. } => "UnknownMessage",
    }
}

/// Owns the session table and drives every session's state machine (§4.5).
pub struct SessionEngine {
    sessions: DashMap<String, Arc<DeviceSession>>,
    listener: RwLock<Arc<dyn ServerListener>>,
    local_identity: SessionParameters,
}

impl SessionEngine {
    pub fn new(local_identity: SessionParameters) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            listener: RwLock::new(Arc::new(NoopServerListener)),
            local_identity,
        })
    }

    pub async fn set_listener(&self, listener: Arc<dyn ServerListener>) {
        *self.listener.write().await = listener;
    }

    async fn listener_snapshot(&self) -> Arc<dyn ServerListener> {
        self.listener.read().await.clone()
    }

    /// Accept a freshly connected transport into `AWAITING_SESSION` and
    /// spawn its session task (§4.5, §4.6 inbound/outbound entry point).
    pub async fn accept(
        self: &Arc<Self>,
        transport: Box<dyn FrameTransport>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Arc<DeviceSession> {
        let id = generate_session_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let session = Arc::new(DeviceSession {
            id: id.clone(),
            data: RwLock::new(SessionData {
                state: SessionState::AwaitingSession,
                remote: None,
                latest_supply: None,
                latest_demand: None,
                latest_storage: None,
            }),
            cmd_tx,
        });
        self.sessions.insert(id, session.clone());

        let snap = session.snapshot().await;
        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_session_created(snap));

        let engine = self.clone();
        let sess = session.clone();
        tokio::spawn(async move {
            run_session_task(engine, sess, hooks, transport, cmd_rx).await;
        });

        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        match self.get(session_id) {
            Some(session) => Some(session.state().await),
            None => None,
        }
    }

    /// Request a graceful disconnect (§4.5). No-op if the session isn't
    /// currently tracked.
    pub async fn disconnect(&self, session_id: &str, reason: Option<String>) {
        if let Some(session) = self.get(session_id) {
            let _ = session.cmd_tx.send(SessionCommand::Disconnect(reason)).await;
        }
    }

    /// Idempotent hard close: no SoftDisconnect is sent.
    pub async fn close_session(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            let _ = session.cmd_tx.send(SessionCommand::Close).await;
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_session(&id).await;
        }
    }

    /// Dispatch one successfully parsed message per the current state
    /// (§4.5 handshake rule / active dispatch rules). `Break` means the
    /// session task should stop reading and finalize the close.
    async fn handle_message(
        self: &Arc<Self>,
        session: &Arc<DeviceSession>,
        hooks: &Arc<dyn SessionHooks>,
        transport: &mut MessageTransport<Box<dyn FrameTransport>>,
        message: Message,
    ) -> ControlFlow<()> {
        let state = session.state().await;
        match state {
            SessionState::AwaitingSession => match message {
                Message::SessionParameters(remote) => {
                    {
                        let mut data = session.data.write().await;
                        data.remote = Some(remote.clone());
                        data.state = SessionState::Active;
                    }
                    hooks.bind_inbound(&session.id, &remote).await;
                    let reply = Message::SessionParameters(self.local_identity.clone());
                    let _ = transport.send(&reply).await;
                    let snap = session.snapshot().await;
                    let listener = self.listener_snapshot().await;
                    isolate(|| listener.on_session_active(snap));
                    ControlFlow::Continue(())
                }
                other => {
                    let reason = format!(
                        "expected SessionParameters as the first message, got {}",
                        message_type_name(&other)
                    );
                    {
                        let mut data = session.data.write().await;
                        data.state = SessionState::Closed;
                    }
                    let snap = session.snapshot().await;
                    let listener = self.listener_snapshot().await;
                    isolate(|| listener.on_session_handshake_failed(snap, reason));
                    ControlFlow::Break(())
                }
            },
            SessionState::Active => {
                match &message {
                    Message::SupplyParameters(p) => {
                        session.data.write().await.latest_supply = Some(p.clone());
                        hooks.on_parameters_updated(&session.id).await;
                    }
                    Message::DemandParameters(p) => {
                        session.data.write().await.latest_demand = Some(p.clone());
                        hooks.on_parameters_updated(&session.id).await;
                    }
                    Message::StorageParameters(p) => {
                        session.data.write().await.latest_storage = Some(p.clone());
                        hooks.on_parameters_updated(&session.id).await;
                    }
                    Message::SoftDisconnect(_) => {
                        session.data.write().await.state = SessionState::Disconnecting;
                        let snap = session.snapshot().await;
                        let listener = self.listener_snapshot().await;
                        isolate(|| listener.on_session_disconnecting(snap));
                    }
                    Message::Ping | Message::UnknownMessage { .. } | Message::SessionParameters(_) => {}
                }
                let snap = session.snapshot().await;
                let listener = self.listener_snapshot().await;
                isolate(|| listener.on_message_received(snap));
                ControlFlow::Continue(())
            }
            SessionState::Disconnecting | SessionState::Closed => {
                let snap = session.snapshot().await;
                let listener = self.listener_snapshot().await;
                isolate(|| listener.on_message_received(snap));
                ControlFlow::Continue(())
            }
        }
    }

    /// Local-initiated disconnect: send SoftDisconnect and fire the
    /// callback. The caller breaks the session task's loop right after.
    async fn perform_disconnect(
        self: &Arc<Self>,
        session: &Arc<DeviceSession>,
        transport: &mut MessageTransport<Box<dyn FrameTransport>>,
        reason: Option<String>,
    ) {
        let was_active = {
            let mut data = session.data.write().await;
            if data.state != SessionState::Active {
                false
            } else {
                data.state = SessionState::Disconnecting;
                true
            }
        };
        if !was_active {
            return;
        }
        let msg = Message::SoftDisconnect(SoftDisconnect {
            reconnect: Some(false),
            reason,
        });
        let _ = transport.send(&msg).await;
        let snap = session.snapshot().await;
        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_session_disconnecting(snap));
    }

    async fn finalize_close(self: &Arc<Self>, session: &Arc<DeviceSession>, hooks: &Arc<dyn SessionHooks>) {
        if self.sessions.remove(&session.id).is_none() {
            return;
        }
        {
            let mut data = session.data.write().await;
            data.state = SessionState::Closed;
        }
        hooks.on_session_closed(&session.id).await;
        let snap = session.snapshot().await;
        let listener = self.listener_snapshot().await;
        isolate(|| listener.on_session_closed(snap));
    }
}

async fn run_session_task(
    engine: Arc<SessionEngine>,
    session: Arc<DeviceSession>,
    hooks: Arc<dyn SessionHooks>,
    transport_raw: Box<dyn FrameTransport>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
) {
    let mut transport = MessageTransport::new(transport_raw, ParseMode::Lenient);

    'task: loop {
        tokio::select! {
            recv = transport.recv_outcome() => {
                match recv {
                    Ok(None) => break 'task,
                    Ok(Some(ParseOutcome::Success { message, .. })) => {
                        if engine
                            .handle_message(&session, &hooks, &mut transport, message)
                            .await
                            .is_break()
                        {
                            break 'task;
                        }
                    }
                    Ok(Some(ParseOutcome::Failure { diagnostics })) => {
                        let reason = format!("{diagnostics:?}");
                        let snap = session.snapshot().await;
                        let listener = engine.listener_snapshot().await;
                        isolate(|| listener.on_session_error(snap, reason.clone()));
                        hooks.on_session_error(&session.id, reason).await;
                        break 'task;
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        let snap = session.snapshot().await;
                        let listener = engine.listener_snapshot().await;
                        isolate(|| listener.on_session_error(snap, reason.clone()));
                        hooks.on_session_error(&session.id, reason).await;
                        break 'task;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Disconnect(reason)) => {
                        engine.perform_disconnect(&session, &mut transport, reason).await;
                        break 'task;
                    }
                    Some(SessionCommand::Send(msg, reply)) => {
                        let result = transport.send(&msg).await;
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Close) | None => break 'task,
                }
            }
        }
    }

    let _ = transport.close().await;
    engine.finalize_close(&session, &hooks).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use energynet_transport::TcpFrameTransport;
    use energynet_wire::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (server, _) = listener.accept().await.expect("accept");
        let client = client.await.expect("join").expect("connect");
        (client, server)
    }

    struct NoopHooks;
    #[async_trait::async_trait]
    impl SessionHooks for NoopHooks {
        async fn bind_inbound(&self, _session_id: &str, _remote: &SessionParameters) {}
        async fn on_parameters_updated(&self, _session_id: &str) {}
        async fn on_session_error(&self, _session_id: &str, _error: String) {}
        async fn on_session_closed(&self, _session_id: &str) {}
    }

    #[derive(Default)]
    struct RecordingListener {
        active: AtomicUsize,
        handshake_failed: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ServerListener for RecordingListener {
        fn on_session_active(&self, _session: DeviceSessionSnapshot) {
            self.active.fetch_add(1, Ordering::SeqCst);
        }
        fn on_session_handshake_failed(&self, _session: DeviceSessionSnapshot, _reason: String) {
            self.handshake_failed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_session_closed(&self, _session: DeviceSessionSnapshot) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

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
    async fn handshake_happy_path_transitions_to_active() {
        let (client, server) = connected_pair().await;
        let engine = SessionEngine::new(identity("node-a"));
        let listener = Arc::new(RecordingListener::default());
        engine.set_listener(listener.clone()).await;

        let _session = engine
            .accept(Box::new(TcpFrameTransport::new(server)), Arc::new(NoopHooks))
            .await;

        let mut remote = MessageTransport::new(TcpFrameTransport::new(client), ParseMode::Lenient);
        remote
            .send(&Message::SessionParameters(identity("node-b")))
            .await
            .expect("send session parameters");
        let reply = remote.recv().await.expect("recv").expect("some reply");
        assert!(matches!(reply.message, Message::SessionParameters(_)));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(listener.active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handshake_failure_on_non_session_parameters_first_message() {
        let (client, server) = connected_pair().await;
        let engine = SessionEngine::new(identity("node-a"));
        let listener = Arc::new(RecordingListener::default());
        engine.set_listener(listener.clone()).await;

        let _session = engine
            .accept(Box::new(TcpFrameTransport::new(server)), Arc::new(NoopHooks))
            .await;

        let mut remote = MessageTransport::new(TcpFrameTransport::new(client), ParseMode::Lenient);
        remote.send(&Message::Ping).await.expect("send ping");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(listener.handshake_failed.load(Ordering::SeqCst), 1);
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_sends_soft_disconnect_then_closes() {
        let (client, server) = connected_pair().await;
        let engine = SessionEngine::new(identity("node-a"));
        let listener = Arc::new(RecordingListener::default());
        engine.set_listener(listener.clone()).await;

        let session = engine
            .accept(Box::new(TcpFrameTransport::new(server)), Arc::new(NoopHooks))
            .await;

        let mut remote = MessageTransport::new(TcpFrameTransport::new(client), ParseMode::Lenient);
        remote
            .send(&Message::SessionParameters(identity("node-b")))
            .await
            .expect("send session parameters");
        let _reply = remote.recv().await.expect("recv").expect("some reply");

        engine.disconnect(&session.id, Some("bye".to_string())).await;

        let soft = remote.recv().await.expect("recv").expect("soft disconnect");
        assert!(matches!(soft.message, Message::SoftDisconnect(_)));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    }
}
