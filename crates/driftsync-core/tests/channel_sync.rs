//! End-to-end sync over a negotiated peer channel
//!
//! The offer/answer leg runs through an in-process exchange closure standing
//! in for whatever out-of-band path carries it in production.

use std::sync::Arc;

use driftsync_core::storage::MemoryCheckpoints;
use driftsync_core::sync::channel::{in_process_pair, StaticConnector};
use driftsync_core::{
    AnswerExchange, DeviceId, EngineConfig, SessionStatus, SyncDoc, SyncEngine, SyncError,
    SyncMethod, SyncOptions,
};

fn channel_engines() -> (SyncEngine, SyncEngine) {
    let (initiator_side, responder_side) = in_process_pair();
    let alice = SyncEngine::new(
        DeviceId::new("alice"),
        EngineConfig::new(Arc::new(MemoryCheckpoints::new()))
            .with_connector(Arc::new(StaticConnector::new(initiator_side))),
    );
    let bob = SyncEngine::new(
        DeviceId::new("bob"),
        EngineConfig::new(Arc::new(MemoryCheckpoints::new()))
            .with_connector(Arc::new(StaticConnector::new(responder_side))),
    );
    (alice, bob)
}

/// Routes the initiator's offer into the responder engine and returns the
/// answer, the way a signaling service would.
fn responder_exchange(responder: SyncEngine, initiator_id: &str) -> AnswerExchange {
    let initiator_id = DeviceId::new(initiator_id);
    Arc::new(move |offer| {
        let responder = responder.clone();
        let initiator_id = initiator_id.clone();
        Box::pin(async move { responder.accept_remote_peer(&initiator_id, &offer).await })
    })
}

#[tokio::test]
async fn test_negotiated_channel_sync_converges() {
    let (alice, bob) = channel_engines();
    alice.initialize(SyncDoc::new()).await.unwrap();
    bob.initialize(SyncDoc::new()).await.unwrap();

    alice
        .edit(|doc| doc.set_value("from-alice", "a"))
        .await
        .unwrap();
    bob.edit(|doc| doc.set_value("from-bob", "b"))
        .await
        .unwrap();

    let options =
        SyncOptions::default().with_answer_exchange(responder_exchange(bob.clone(), "alice"));
    let session = alice
        .sync_with_peer(&DeviceId::new("bob"), options)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.method, SyncMethod::RemotePeer);
    assert_eq!(session.changes_sent, 1);
    assert_eq!(session.changes_received, 1);

    let on_alice = alice.edit(|doc| doc.get_value("from-bob")).await.unwrap();
    assert_eq!(on_alice.as_deref(), Some("b"));
    let on_bob = bob.edit(|doc| doc.get_value("from-alice")).await.unwrap();
    assert_eq!(on_bob.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_responder_records_remote_peer_session() {
    let (alice, bob) = channel_engines();
    alice.initialize(SyncDoc::new()).await.unwrap();
    bob.initialize(SyncDoc::new()).await.unwrap();
    alice.edit(|doc| doc.set_value("k", "v")).await.unwrap();

    let options =
        SyncOptions::default().with_answer_exchange(responder_exchange(bob.clone(), "alice"));
    alice
        .sync_with_peer(&DeviceId::new("bob"), options)
        .await
        .unwrap();

    let sessions = bob.sessions().sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].method, SyncMethod::RemotePeer);
    assert_eq!(sessions[0].peer_id.as_str(), "alice");
    assert_eq!(sessions[0].status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_failed_negotiation_fails_session() {
    let (alice, _bob) = channel_engines();
    alice.initialize(SyncDoc::new()).await.unwrap();

    let broken: AnswerExchange = Arc::new(|_offer| {
        Box::pin(async { Err(SyncError::Network("signaling down".to_string())) })
    });
    let result = alice
        .sync_with_peer(
            &DeviceId::new("bob"),
            SyncOptions::default().with_answer_exchange(broken),
        )
        .await;
    assert!(matches!(result, Err(SyncError::NegotiationFailed(_))));

    let sessions = alice.sessions().sessions();
    assert_eq!(sessions.len(), 1);
    assert!(matches!(sessions[0].status, SessionStatus::Error(_)));
}

#[tokio::test]
async fn test_channel_selected_only_with_answer_path() {
    let (alice, _bob) = channel_engines();
    alice.initialize(SyncDoc::new()).await.unwrap();

    // Connector configured but no answer path: falls back to manual.
    let result = alice
        .sync_with_peer(&DeviceId::new("bob"), SyncOptions::default())
        .await;
    assert!(matches!(result, Err(SyncError::TransportUnavailable(_))));
}

#[tokio::test]
async fn test_second_channel_cycle_is_empty() {
    let (alice, bob) = channel_engines();
    alice.initialize(SyncDoc::new()).await.unwrap();
    bob.initialize(SyncDoc::new()).await.unwrap();
    alice.edit(|doc| doc.set_value("k", "v")).await.unwrap();

    let options =
        SyncOptions::default().with_answer_exchange(responder_exchange(bob.clone(), "alice"));
    let first = alice
        .sync_with_peer(&DeviceId::new("bob"), options)
        .await
        .unwrap();
    assert_eq!(first.changes_sent, 1);

    // A fresh pair for the second handshake; tokens are single-session.
    let (alice2_side, bob2_side) = in_process_pair();
    let alice2 = SyncEngine::new(
        DeviceId::new("alice"),
        EngineConfig::new(Arc::new(MemoryCheckpoints::new()))
            .with_connector(Arc::new(StaticConnector::new(alice2_side))),
    );
    alice2
        .initialize(SyncDoc::load(&alice.snapshot().await.unwrap()).unwrap())
        .await
        .unwrap();
    let bob2 = SyncEngine::new(
        DeviceId::new("bob"),
        EngineConfig::new(Arc::new(MemoryCheckpoints::new()))
            .with_connector(Arc::new(StaticConnector::new(bob2_side))),
    );
    bob2.initialize(SyncDoc::load(&bob.snapshot().await.unwrap()).unwrap())
        .await
        .unwrap();

    let options =
        SyncOptions::default().with_answer_exchange(responder_exchange(bob2.clone(), "alice"));
    let second = alice2
        .sync_with_peer(&DeviceId::new("bob"), options)
        .await
        .unwrap();

    // Fresh engines have no checkpoints, so full (already-known) history is
    // resent, but applying it changes nothing.
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(second.changes_received, 0);
}
