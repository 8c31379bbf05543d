//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on a free port and drives it with real
//! `SyncClient`s.

use schemaflow_collab::client::{ConnectionState, SyncClient, SyncEvent};
use schemaflow_collab::protocol::{ErrorCode, PatchAckStatus};
use schemaflow_collab::server::{SyncContext, SyncServer};
use schemaflow_collab::storage::{MemoryStore, PatchDocumentStore};
use schemaflow_collab::{ServerConfig, StaticTokenVerifier};
use schemaflow_core::{
    parse_patches, OptimisticReplica, OutgoingPatch, PatchedDocument, ReplicaState,
    SyncStrategy, WorkspaceId,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use yrs::{Doc, GetString, ReadTxn, Text, Transact, WriteTxn};

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::in_memory("127.0.0.1:0")
        .with_token("t-alice", "u-a", "alice")
        .with_token("t-bob", "u-b", "bob")
        .with_token("t-carol", "u-c", "carol");
    config.broadcast_capacity = 64;
    config.persistence.merge_debounce_ms = 50;
    config
}

/// Serve `ctx` on a free port and return its URL.
async fn serve(ctx: Arc<SyncContext>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::with_context(ctx);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://{addr}")
}

async fn start_test_server() -> (String, Arc<SyncContext>) {
    let ctx = Arc::new(SyncContext::from_config(test_config()).unwrap());
    (serve(ctx.clone()).await, ctx)
}

/// Wait for the first event `f` accepts, skipping the rest.
async fn wait_for<T>(
    rx: &mut mpsc::Receiver<SyncEvent>,
    mut f: impl FnMut(SyncEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(3), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Some(found) = f(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn connect(url: &str, token: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url, token);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::Authenticated { .. }).then_some(())
    })
    .await;
    (client, events)
}

async fn join_merge(
    client: &SyncClient,
    events: &mut mpsc::Receiver<SyncEvent>,
    ws: &WorkspaceId,
) -> (Vec<u8>, u64) {
    client.join(ws.clone(), SyncStrategy::Merge).await.unwrap();
    wait_for(events, |e| match e {
        SyncEvent::Snapshot { state, version, .. } => Some((state, version)),
        _ => None,
    })
    .await
}

fn text_update(insert: &str) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, insert);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&yrs::StateVector::default())
}

fn text_of(state: &[u8]) -> String {
    use yrs::updates::decoder::Decode;
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(yrs::Update::decode_v1(state).unwrap()).unwrap();
    }
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_authenticates() {
    let (url, _) = start_test_server().await;
    let mut client = SyncClient::new(&url, "t-alice");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let username = wait_for(&mut events, |e| match e {
        SyncEvent::Authenticated { username, .. } => Some(username),
        _ => None,
    })
    .await;
    assert_eq!(username, "alice");
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_bad_token_is_refused() {
    let (url, _) = start_test_server().await;
    let mut client = SyncClient::new(&url, "nope");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let code = wait_for(&mut events, |e| match e {
        SyncEvent::ServerError { code, .. } => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code, ErrorCode::AuthFailed);
    wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected).then_some(())).await;
}

#[tokio::test]
async fn test_update_reaches_peer_and_snapshot() {
    let (url, ctx) = start_test_server().await;
    let ws = WorkspaceId::from("W1");

    let (alice, mut alice_events) = connect(&url, "t-alice").await;
    let (bob, mut bob_events) = connect(&url, "t-bob").await;

    let (_, version) = join_merge(&alice, &mut alice_events, &ws).await;
    assert_eq!(version, 0);
    join_merge(&bob, &mut bob_events, &ws).await;

    let u1 = text_update("U1");
    alice.send_update(u1.clone()).await.unwrap();

    let received = wait_for(&mut bob_events, |e| match e {
        SyncEvent::RemoteUpdate { update, .. } => Some(update),
        _ => None,
    })
    .await;
    assert_eq!(received, u1);

    // never echoed to the origin
    let echo = timeout(
        Duration::from_millis(200),
        wait_for(&mut alice_events, |e| match e {
            SyncEvent::RemoteUpdate { .. } => Some(()),
            _ => None,
        }),
    )
    .await;
    assert!(echo.is_err(), "origin must not receive its own update");

    // debounce window elapses, one flush
    tokio::time::sleep(Duration::from_millis(300)).await;
    let doc = ctx.registry.get(&ws).await.unwrap();
    assert_eq!(doc.version().await, 1);
    assert_eq!(doc.pending_updates().await, 0);

    let (carol, mut carol_events) = connect(&url, "t-carol").await;
    let (state, version) = join_merge(&carol, &mut carol_events, &ws).await;
    assert_eq!(version, 1);
    assert_eq!(text_of(&state), "U1");
}

#[tokio::test]
async fn test_update_rejected_on_patch_strategy() {
    let (url, _) = start_test_server().await;
    let (alice, mut events) = connect(&url, "t-alice").await;

    alice
        .join(WorkspaceId::from("W1"), SyncStrategy::Patch)
        .await
        .unwrap();
    alice.send_update(text_update("x")).await.unwrap();

    let code = wait_for(&mut events, |e| match e {
        SyncEvent::ServerError { code, .. } => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code, ErrorCode::WrongStrategy);
}

#[tokio::test]
async fn test_offline_updates_replay_on_join() {
    let (url, ctx) = start_test_server().await;
    let ws = WorkspaceId::from("W1");

    let mut alice = SyncClient::new(&url, "t-alice");
    let mut events = alice.take_event_rx().unwrap();
    alice.send_update(text_update("offline")).await.unwrap();
    assert_eq!(alice.offline_queue_len().await, 1);

    alice.connect().await.unwrap();
    join_merge(&alice, &mut events, &ws).await;
    assert_eq!(alice.offline_queue_len().await, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = ctx.registry.encode_full_state(&ws).await.unwrap();
    assert_eq!(text_of(&state), "offline");
}

#[tokio::test]
async fn test_patch_conflict_and_resync() {
    let store = Arc::new(MemoryStore::new());
    let config = test_config();
    let verifier = Arc::new(StaticTokenVerifier::from_table(&config.tokens));
    let ctx = Arc::new(SyncContext::new(config, store.clone(), store.clone(), verifier));
    let url = serve(ctx).await;

    let ws = WorkspaceId::from("D1");
    let seeded = PatchedDocument::with_content(ws.clone(), 5, json!({"title": "v5"}));
    assert!(store.compare_and_swap(&seeded, 0).unwrap());

    let (alice, mut alice_events) = connect(&url, "t-alice").await;
    let (bob, mut bob_events) = connect(&url, "t-bob").await;

    for (client, events) in [(&alice, &mut alice_events), (&bob, &mut bob_events)] {
        client.join(ws.clone(), SyncStrategy::Patch).await.unwrap();
        let version = wait_for(events, |e| match e {
            SyncEvent::FullDocument { version, .. } => Some(version),
            _ => None,
        })
        .await;
        assert_eq!(version, 5);
    }

    // stale base version
    let stale = OutgoingPatch {
        patches: parse_patches(r#"[{"op":"replace","path":"/title","value":"stale"}]"#).unwrap(),
        base_version: 3,
        temp_id: "tmp-1".into(),
    };
    alice.send_patch(&stale).await.unwrap();
    let (temp_id, status) = wait_for(&mut alice_events, |e| match e {
        SyncEvent::PatchAck {
            temp_id, status, ..
        } => Some((temp_id, status)),
        _ => None,
    })
    .await;
    assert_eq!(temp_id, "tmp-1");
    match status {
        PatchAckStatus::Conflict {
            server_version,
            content_json,
        } => {
            assert_eq!(server_version, 5);
            let content: serde_json::Value = serde_json::from_str(&content_json).unwrap();
            assert_eq!(content, json!({"title": "v5"}));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(store.load_document(&ws).unwrap().unwrap(), seeded);

    // the replica state machine drives the retry
    let mut replica = OptimisticReplica::new(PatchedDocument::with_content(
        ws.clone(),
        5,
        json!({"title": "v5"}),
    ));
    let outgoing = replica
        .local_edit(parse_patches(r#"[{"op":"replace","path":"/title","value":"v6"}]"#).unwrap())
        .unwrap()
        .unwrap();
    alice.send_patch(&outgoing).await.unwrap();
    let status = wait_for(&mut alice_events, |e| match e {
        SyncEvent::PatchAck { status, .. } => Some(status),
        _ => None,
    })
    .await;
    assert_eq!(status, PatchAckStatus::Applied { version: 6 });
    assert!(replica.on_ack(&outgoing.temp_id, 6).is_none());
    assert_eq!(replica.state(), ReplicaState::Synced);

    let (patches_json, version) = wait_for(&mut bob_events, |e| match e {
        SyncEvent::RemotePatch {
            patches_json,
            version,
            ..
        } => Some((patches_json, version)),
        _ => None,
    })
    .await;
    assert_eq!(version, 6);
    assert_eq!(parse_patches(&patches_json).unwrap(), outgoing.patches);

    bob.request_full().await.unwrap();
    let content = wait_for(&mut bob_events, |e| match e {
        SyncEvent::FullDocument { content, .. } => Some(content),
        _ => None,
    })
    .await;
    assert_eq!(content, json!({"title": "v6"}));
}

#[tokio::test]
async fn test_schema_change_reaches_room() {
    let (url, ctx) = start_test_server().await;
    let ws = WorkspaceId::from("W1");

    let (alice, mut alice_events) = connect(&url, "t-alice").await;
    let (bob, mut bob_events) = connect(&url, "t-bob").await;
    join_merge(&alice, &mut alice_events, &ws).await;
    join_merge(&bob, &mut bob_events, &ws).await;

    alice
        .schema_change("users", "Users", &json!({"columns": ["id", "email"]}))
        .await
        .unwrap();

    let (schema_id, version) = wait_for(&mut bob_events, |e| match e {
        SyncEvent::WorkspaceUpdated {
            schema_id, version, ..
        } => Some((schema_id, version)),
        _ => None,
    })
    .await;
    assert_eq!(schema_id.as_deref(), Some("users"));
    assert_eq!(version, Some(1));

    let saved = ctx.schemas.shared_schema(&ws, "users").await.unwrap();
    assert_eq!(saved.content, json!({"columns": ["id", "email"]}));
}

#[tokio::test]
async fn test_direct_notification() {
    let (url, ctx) = start_test_server().await;
    let (_bob, mut events) = connect(&url, "t-bob").await;

    let delivered = ctx
        .notify_user(
            "bob",
            &schemaflow_collab::SyncMessage::error(ErrorCode::Internal, "maintenance"),
        )
        .await;
    assert_eq!(delivered, 1);

    let message = wait_for(&mut events, |e| match e {
        SyncEvent::ServerError { message, .. } => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(message, "maintenance");
}

#[tokio::test]
async fn test_lagging_peer_converges_after_resync() {
    use yrs::updates::decoder::Decode;

    let mut config = test_config();
    config.broadcast_capacity = 1;
    let ctx = Arc::new(SyncContext::from_config(config).unwrap());
    let url = serve(ctx.clone()).await;
    let ws = WorkspaceId::from("W1");

    let (alice, mut alice_events) = connect(&url, "t-alice").await;
    let (bob, mut bob_events) = connect(&url, "t-bob").await;
    join_merge(&alice, &mut alice_events, &ws).await;
    let (initial, _) = join_merge(&bob, &mut bob_events, &ws).await;

    let tokens: Vec<String> = (0..20).map(|i| format!("<{i:02}>")).collect();
    for token in &tokens {
        alice.send_update(text_update(token)).await.unwrap();
    }

    let replica = Doc::new();
    let merge = |bytes: &[u8]| {
        let mut txn = replica.transact_mut();
        txn.apply_update(yrs::Update::decode_v1(bytes).unwrap()).unwrap();
    };
    merge(&initial);

    timeout(Duration::from_secs(5), async {
        loop {
            let text = {
                let txn = replica.transact();
                txn.get_text("content")
                    .map(|t| t.get_string(&txn))
                    .unwrap_or_default()
            };
            if tokens.iter().all(|t| text.contains(t.as_str())) {
                break;
            }
            match bob_events.recv().await.expect("event channel closed") {
                SyncEvent::RemoteUpdate { update, .. } => merge(&update),
                SyncEvent::Snapshot { state, .. } => merge(&state),
                _ => {}
            }
        }
    })
    .await
    .expect("bob never converged");
}

#[tokio::test]
async fn test_patches_over_limit_are_rejected() {
    let mut config = test_config();
    config.max_patches_per_sec = 2;
    let ctx = Arc::new(SyncContext::from_config(config).unwrap());
    let url = serve(ctx).await;
    let ws = WorkspaceId::from("D1");

    let (alice, mut events) = connect(&url, "t-alice").await;
    alice.join(ws.clone(), SyncStrategy::Patch).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SyncEvent::FullDocument { .. }).then_some(())
    })
    .await;

    for i in 0..3 {
        let patch = OutgoingPatch {
            patches: parse_patches(&format!(r#"[{{"op":"add","path":"/k{i}","value":{i}}}]"#))
                .unwrap(),
            base_version: i,
            temp_id: format!("tmp-{i}"),
        };
        alice.send_patch(&patch).await.unwrap();
    }

    let mut statuses = Vec::new();
    while statuses.len() < 3 {
        let ack = wait_for(&mut events, |e| match e {
            SyncEvent::PatchAck {
                temp_id, status, ..
            } => Some((temp_id, status)),
            _ => None,
        })
        .await;
        statuses.push(ack);
    }
    assert_eq!(statuses[0].1, PatchAckStatus::Applied { version: 1 });
    assert_eq!(statuses[1].1, PatchAckStatus::Applied { version: 2 });
    assert_eq!(statuses[2].0, "tmp-2");
    assert_eq!(
        statuses[2].1,
        PatchAckStatus::Rejected {
            reason: schemaflow_collab::RATE_LIMITED.to_string(),
        }
    );
}

#[tokio::test]
async fn test_leave_for_other_room_keeps_membership() {
    use futures_util::{SinkExt, Stream, StreamExt};
    use schemaflow_collab::SyncMessage;
    use tokio_tungstenite::tungstenite::Message;

    let (url, ctx) = start_test_server().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    async fn next_message<S>(socket: &mut S) -> SyncMessage
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        timeout(Duration::from_secs(3), async {
            loop {
                if let Message::Binary(data) = socket.next().await.unwrap().unwrap() {
                    return SyncMessage::decode(&data).unwrap();
                }
            }
        })
        .await
        .expect("no message")
    }

    let w1 = WorkspaceId::from("W1");
    let w2 = WorkspaceId::from("W2");
    for msg in [
        SyncMessage::Authenticate {
            token: "t-alice".into(),
        },
        SyncMessage::Join {
            workspace_id: w1.clone(),
            strategy: SyncStrategy::Merge,
        },
        SyncMessage::Leave {
            workspace_id: w2.clone(),
        },
    ] {
        socket
            .send(Message::Binary(msg.encode().unwrap().into()))
            .await
            .unwrap();
    }

    let connection_id = match next_message(&mut socket).await {
        SyncMessage::Authenticated { connection_id, .. } => connection_id,
        other => panic!("unexpected {other:?}"),
    };
    loop {
        match next_message(&mut socket).await {
            SyncMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::NotJoined);
                break;
            }
            SyncMessage::FullSnapshot { .. } | SyncMessage::MemberJoined { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(ctx.tracker.workspace_of(connection_id).await, Some(w1.clone()));

    socket
        .send(Message::Binary(
            SyncMessage::Leave {
                workspace_id: w1.clone(),
            }
            .encode()
            .unwrap()
            .into(),
        ))
        .await
        .unwrap();
    timeout(Duration::from_secs(3), async {
        while ctx.tracker.workspace_of(connection_id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("leave never applied");
}

#[tokio::test]
async fn test_private_workspace_refuses_non_members() {
    let config = test_config().with_private_workspace("secret", ["u-a"]);
    let ctx = Arc::new(SyncContext::from_config(config).unwrap());
    let url = serve(ctx.clone()).await;
    let ws = WorkspaceId::from("secret");

    let (bob, mut bob_events) = connect(&url, "t-bob").await;
    bob.join(ws.clone(), SyncStrategy::Merge).await.unwrap();
    let code = wait_for(&mut bob_events, |e| match e {
        SyncEvent::ServerError { code, .. } => Some(code),
        SyncEvent::Snapshot { .. } => panic!("bob received a snapshot"),
        _ => None,
    })
    .await;
    assert_eq!(code, ErrorCode::Forbidden);
    assert!(ctx.tracker.members(&ws).await.is_empty());

    let (alice, mut alice_events) = connect(&url, "t-alice").await;
    join_merge(&alice, &mut alice_events, &ws).await;
    assert_eq!(ctx.tracker.members(&ws).await.len(), 1);
}
