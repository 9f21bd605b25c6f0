use std::{sync::atomic::Ordering, time::Duration};

use chrono::{TimeZone, Utc};
use peer_integration::{MissingMediaDevices, MissingPeerConnector};
use serde_json::json;
use shared::{
    domain::{Conversation, PostId, UserSummary},
    protocol::NotificationKind,
};
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

use super::*;
use crate::{
    call::{CallEvent, CallPhase, EndReason},
    dispatcher::MemoryFeed,
    test_support::{FakeDirectory, FakeTransport, HandshakeScript, ServerEnd},
};

fn conversation(id: &str) -> Conversation {
    Conversation {
        id: id.into(),
        participants: ["u1", "u2"]
            .into_iter()
            .map(|user| UserSummary {
                id: UserId::from(user),
                username: user.to_owned(),
                full_name: String::new(),
                profile_pic: None,
            })
            .collect(),
        last_message: None,
        unread_count: 0,
        updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

fn test_settings() -> ClientSettings {
    ClientSettings {
        heartbeat_interval_secs: 3600,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 40,
        reconnect_attempts: 3,
        ..ClientSettings::default()
    }
}

struct Harness {
    session: Arc<RealtimeSession>,
    transport: Arc<FakeTransport>,
    servers: UnboundedReceiver<ServerEnd>,
    directory: Arc<FakeDirectory>,
    feed: Arc<MemoryFeed>,
    events: broadcast::Receiver<ClientEvent>,
}

fn harness() -> Harness {
    let (transport, servers) = FakeTransport::new();
    let directory = FakeDirectory::with_conversations(vec![conversation("c1")]);
    let feed = MemoryFeed::new();
    let session = RealtimeSession::new(
        &test_settings(),
        UserId::from("u1"),
        SessionDependencies {
            transport: transport.clone(),
            directory: directory.clone(),
            media: Arc::new(MissingMediaDevices),
            peers: Arc::new(MissingPeerConnector),
            feed: Some(feed.clone()),
            notifications: None,
        },
    );
    let events = session.subscribe_events();
    Harness {
        session,
        transport,
        servers,
        directory,
        feed,
        events,
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event should arrive")
}

#[tokio::test]
async fn open_connects_and_loads_conversations() {
    let mut h = harness();
    h.session.open("token").await.expect("open");
    let mut server = h.servers.recv().await.expect("server end");
    server.expect_event("join").await;

    next_event(&mut h.events, |e| {
        matches!(e, ClientEvent::Connection(ChannelSignal::Connected))
    })
    .await;
    next_event(&mut h.events, |e| matches!(e, ClientEvent::ConversationsReloaded)).await;
    assert_eq!(h.session.messages().conversations().await.len(), 1);
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);

    server.send_event(
        "new_post",
        json!({"_id": "p1", "user": {"_id": "u2"}, "createdAt": "2024-05-01T10:00:00Z"}),
    );
    next_event(&mut h.events, |e| matches!(e, ClientEvent::PostAdded(_))).await;
    assert!(h.feed.post(&PostId::from("p1")).await.is_some());
}

#[tokio::test]
async fn restored_connection_resyncs_conversations() {
    let mut h = harness();
    h.session.open("token").await.expect("open");
    let server = h.servers.recv().await.expect("server end");
    next_event(&mut h.events, |e| matches!(e, ClientEvent::ConversationsReloaded)).await;

    h.directory
        .conversations
        .lock()
        .unwrap()
        .push(conversation("c2"));
    drop(server);

    next_event(&mut h.events, |e| {
        matches!(e, ClientEvent::Connection(ChannelSignal::ConnectionRestored))
    })
    .await;
    next_event(&mut h.events, |e| matches!(e, ClientEvent::ConversationsReloaded)).await;
    assert_eq!(h.directory.list_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.session.messages().conversations().await.len(), 2);
    assert_eq!(h.transport.opens(), 2);
}

#[tokio::test]
async fn rejected_credentials_sign_the_session_out() {
    let mut h = harness();
    h.transport.script(HandshakeScript::Reject {
        message: "jwt expired",
        code: "unauthorized",
    });

    let err = h.session.open("stale").await.expect_err("rejected");
    assert!(matches!(err, ChannelError::AuthRejected(_)));
    next_event(&mut h.events, |e| {
        matches!(e, ClientEvent::Connection(ChannelSignal::AuthRejected { .. }))
    })
    .await;
    next_event(&mut h.events, |e| matches!(e, ClientEvent::SignedOut)).await;
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.directory.list_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn notifications_are_relayed_to_the_channel() {
    let mut h = harness();
    h.session.open("token").await.expect("open");
    let mut server = h.servers.recv().await.expect("server end");
    server.expect_event("join").await;

    h.session
        .send_notification(NotificationRequest {
            kind: NotificationKind::Comment,
            receiver_id: UserId::from("u2"),
            post_id: Some(PostId::from("p1")),
            comment_text: Some("nice".into()),
        })
        .expect("relay");
    let frame = server.expect_event("send_notification").await;
    assert_eq!(
        frame["data"],
        json!({"type": "comment", "receiverId": "u2", "postId": "p1", "commentText": "nice"})
    );
}

#[tokio::test]
async fn close_ends_a_ringing_call_before_disconnecting() {
    let mut h = harness();
    h.session.open("token").await.expect("open");
    let mut server = h.servers.recv().await.expect("server end");
    server.expect_event("join").await;

    server.send_event(
        "incoming-call",
        json!({"roomId": "r1", "caller": "u2", "type": "audio"}),
    );
    next_event(&mut h.events, |e| {
        matches!(e, ClientEvent::Call(CallEvent::Incoming { .. }))
    })
    .await;
    assert_eq!(h.session.calls().phase().await, CallPhase::Incoming);

    h.session.close().await;
    let frame = server.expect_event("decline-call").await;
    assert_eq!(frame["data"], json!({"roomId": "r1"}));
    server.expect_event("manual-disconnect").await;
    next_event(&mut h.events, |e| {
        matches!(
            e,
            ClientEvent::Call(CallEvent::Ended {
                reason: EndReason::Shutdown,
                ..
            })
        )
    })
    .await;
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
}
