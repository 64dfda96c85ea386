//! Integration-style tests wiring the session engine, peer manager, and
//! transfer engine together through the public API (§8: handshake happy
//! path, peer binding, and transfer timing scenarios).

use std::sync::Arc;
use std::time::Duration;

use energynet_engine::{Direction, PeerConfig, PeerManager, SessionEngine, StartTransferResult, TransferEngine, TransferParams};
use energynet_transport::{MessageTransport, TcpFrameTransport};
use energynet_wire::{Message, ParseMode, SessionParameters, SupplyParameters};
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

#[tokio::test]
async fn inbound_handshake_binds_peer_and_starts_a_transfer() {
    let (client, server) = connected_pair().await;
    let session_engine = SessionEngine::new(identity("node-a"));
    let peer_manager = PeerManager::new(session_engine.clone());
    let transfer_engine = TransferEngine::new(peer_manager.clone(), session_engine.clone());

    peer_manager
        .add_peer(PeerConfig {
            peer_id: "charger-1".to_string(),
            host: None,
            port: None,
            direction: Direction::Inbound,
            expected_identity: Some("node-b".to_string()),
        })
        .await
        .expect("add peer");

    session_engine
        .accept(Box::new(TcpFrameTransport::new(server)), peer_manager.clone())
        .await;

    let mut remote = MessageTransport::new(TcpFrameTransport::new(client), ParseMode::Lenient);
    remote
        .send(&Message::SessionParameters(identity("node-b")))
        .await
        .expect("send session parameters");
    let reply = remote.recv().await.expect("recv").expect("reply");
    assert!(matches!(reply.message, Message::SessionParameters(_)));

    // Give the session task a moment to finish the bind before starting a
    // transfer against it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let params = TransferParams {
        supply: Some(SupplyParameters {
            power_limit: Some(7500.0),
            ..Default::default()
        }),
        demand: None,
        storage: None,
    };
    let started = transfer_engine
        .start_transfer("charger-1", params, Duration::from_millis(25))
        .await;
    assert!(matches!(started, StartTransferResult::Success(_)));

    let tick = remote.recv().await.expect("recv").expect("first tick");
    assert!(matches!(tick.message, Message::SupplyParameters(_)));

    transfer_engine.stop_transfer("charger-1").await.expect("stop");
    session_engine.close_all().await;
}

#[tokio::test]
async fn transfer_stops_itself_when_its_peer_is_removed() {
    let (client, server) = connected_pair().await;
    let session_engine = SessionEngine::new(identity("node-a"));
    let peer_manager = PeerManager::new(session_engine.clone());
    let transfer_engine = TransferEngine::new(peer_manager.clone(), session_engine.clone());

    peer_manager
        .add_peer(PeerConfig {
            peer_id: "charger-2".to_string(),
            host: None,
            port: None,
            direction: Direction::Inbound,
            expected_identity: Some("node-b".to_string()),
        })
        .await
        .expect("add peer");

    session_engine
        .accept(Box::new(TcpFrameTransport::new(server)), peer_manager.clone())
        .await;

    let mut remote = MessageTransport::new(TcpFrameTransport::new(client), ParseMode::Lenient);
    remote
        .send(&Message::SessionParameters(identity("node-b")))
        .await
        .expect("send session parameters");
    let _reply = remote.recv().await.expect("recv").expect("reply");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let params = TransferParams {
        supply: Some(SupplyParameters {
            power_limit: Some(100.0),
            ..Default::default()
        }),
        demand: None,
        storage: None,
    };
    transfer_engine
        .start_transfer("charger-2", params, Duration::from_millis(500))
        .await;
    let _first = remote.recv().await.expect("recv").expect("first tick");

    // Removing the peer closes its session; the next tick loop iteration
    // should notice the peer is gone and stop on its own (§4.7's forced
    // stop on disconnect, exercised here via direct peer removal rather
    // than socket EOF).
    peer_manager.remove_peer("charger-2").await.expect("remove peer");
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(transfer_engine.get("charger-2").is_none());
}
