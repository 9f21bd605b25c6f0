use std::time::Duration;

use serde_json::json;
use shared::protocol::ReadReceipt;
use tokio::{sync::broadcast, time::timeout};

use super::*;
use crate::test_support::{connected_channel, quiet_settings, FakeTransport, HandshakeScript};

async fn wait_for_signal(
    signals: &mut broadcast::Receiver<ChannelSignal>,
    matches: impl Fn(&ChannelSignal) -> bool,
) -> ChannelSignal {
    timeout(Duration::from_secs(5), async {
        loop {
            let signal = signals.recv().await.expect("signal stream open");
            if matches(&signal) {
                return signal;
            }
        }
    })
    .await
    .expect("signal should arrive")
}

fn receive_message_frame(id: &str) -> serde_json::Value {
    json!({
        "_id": id,
        "sender": {"_id": "u2"},
        "content": format!("body {id}"),
        "conversation": "c1"
    })
}

#[tokio::test]
async fn connect_joins_and_reports_connected() {
    let (transport, mut servers) = FakeTransport::new();
    let channel = EventChannel::new(UserId::from("u1"), quiet_settings(), transport.clone());
    let mut signals = channel.signals();

    channel.connect("token").await.expect("connect");

    let mut server = servers.recv().await.expect("server end");
    let join = server.expect_event("join").await;
    assert_eq!(join["data"], "u1");
    assert_eq!(signals.recv().await.expect("signal"), ChannelSignal::Connected);

    let session = channel.session();
    assert_eq!(session.connection, ConnectionState::Connected);
    assert_eq!(session.user_id, UserId::from("u1"));
    assert_eq!(session.missed_heartbeats, 0);
}

#[tokio::test]
async fn connect_while_connected_is_a_no_op() {
    let (channel, transport, _server, _servers) = connected_channel("u1", quiet_settings()).await;

    channel.connect("token").await.expect("second connect");

    assert_eq!(transport.opens(), 1);
    assert!(channel.is_connected());
}

#[tokio::test]
async fn unauthorized_handshake_is_fatal() {
    let (transport, _servers) = FakeTransport::new();
    transport.script(HandshakeScript::Reject {
        message: "jwt expired",
        code: "unauthorized",
    });
    let channel = EventChannel::new(UserId::from("u1"), quiet_settings(), transport.clone());
    let mut signals = channel.signals();

    let err = channel.connect("stale").await.expect_err("must reject");

    assert_eq!(err, ChannelError::AuthRejected("jwt expired".into()));
    assert_eq!(err.kind(), ErrorKind::AuthRejected);
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        signals.recv().await.expect("signal"),
        ChannelSignal::AuthRejected {
            message: "jwt expired".into()
        }
    );
}

#[tokio::test]
async fn refused_open_is_a_transport_error() {
    let (transport, _servers) = FakeTransport::new();
    transport.script(HandshakeScript::RefuseOpen);
    let channel = EventChannel::new(UserId::from("u1"), quiet_settings(), transport.clone());

    let err = channel.connect("token").await.expect_err("must fail");

    assert!(matches!(err, ChannelError::Transport(_)));
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_handshake() {
    let (transport, _servers) = FakeTransport::new();
    transport.script(HandshakeScript::Silent);
    let channel = EventChannel::new(UserId::from("u1"), quiet_settings(), transport.clone());

    let err = channel.connect("token").await.expect_err("must time out");

    assert!(matches!(err, ChannelError::Transport(reason) if reason.contains("handshake")));
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn emit_while_disconnected_is_not_queued() {
    let (transport, mut servers) = FakeTransport::new();
    let channel = EventChannel::new(UserId::from("u1"), quiet_settings(), transport.clone());

    let err = channel
        .emit(OutboundEvent::Typing("c1".into()))
        .expect_err("not connected");
    assert_eq!(err, ChannelError::NotConnected);

    channel.connect("token").await.expect("connect");
    let mut server = servers.recv().await.expect("server end");
    server.expect_event("join").await;
    assert!(server.drain().is_empty());
}

#[tokio::test]
async fn emit_with_ack_resolves_with_server_payload() {
    let (channel, _transport, mut server, _servers) =
        connected_channel("u1", quiet_settings()).await;

    let pending = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .emit_with_ack(
                    OutboundEvent::MarkMessageRead(ReadReceipt {
                        message_id: "m1".into(),
                        conversation_id: "c1".into(),
                    }),
                    Duration::from_secs(5),
                )
                .await
        }
    });

    let frame = server.expect_event("mark_message_read").await;
    assert_eq!(frame["data"], json!({"messageId": "m1", "conversationId": "c1"}));
    server.ack(&frame, json!({"status": "ok"}));

    let payload = pending.await.expect("join").expect("acked");
    assert_eq!(payload, json!({"status": "ok"}));
}

#[tokio::test(start_paused = true)]
async fn unanswered_ack_times_out() {
    let (channel, _transport, mut server, _servers) =
        connected_channel("u1", quiet_settings()).await;

    let err = channel
        .emit_with_ack(OutboundEvent::Heartbeat, Duration::from_secs(10))
        .await
        .expect_err("no ack");

    assert_eq!(
        err,
        ChannelError::AckTimeout {
            event: "heartbeat",
            timeout: Duration::from_secs(10)
        }
    );
    let frame = server.next_frame().await;
    // A late ack for the expired request is ignored.
    server.ack(&frame, json!({}));
    assert!(channel.is_connected());
}

#[tokio::test]
async fn scopes_receive_in_arrival_order_without_duplicate_registration() {
    let (channel, _transport, server, _servers) = connected_channel("u1", quiet_settings()).await;
    let mut scope = channel.scope("test");
    assert!(scope.on(EventKind::ReceiveMessage));
    assert!(!scope.on(EventKind::ReceiveMessage));
    assert!(scope.on(EventKind::UserTyping));

    server.send_event("receive_message", receive_message_frame("m1"));
    server.send_event(
        "user_typing",
        json!({"conversationId": "c1", "userId": "u2"}),
    );
    server.send_event("receive_message", receive_message_frame("m2"));

    let mut names = Vec::new();
    for _ in 0..3 {
        let event = timeout(Duration::from_secs(5), scope.recv())
            .await
            .expect("delivered")
            .expect("open");
        names.push(match event {
            InboundEvent::ReceiveMessage(message) => message.id.to_string(),
            InboundEvent::UserTyping(_) => "typing".to_owned(),
            other => panic!("unexpected event: {other:?}"),
        });
    }
    assert_eq!(names, vec!["m1", "typing", "m2"]);
    assert!(scope.try_recv().is_none());
}

#[tokio::test]
async fn dropping_a_scope_removes_its_registrations() {
    let (channel, _transport, server, _servers) = connected_channel("u1", quiet_settings()).await;
    let mut kept = channel.scope("kept");
    kept.on(EventKind::ReceiveMessage);
    {
        let mut dropped = channel.scope("dropped");
        dropped.on(EventKind::ReceiveMessage);
        dropped.on(EventKind::NewPost);
        assert!(dropped.is_registered(EventKind::NewPost));
    }

    let fresh = channel.scope("fresh");
    assert!(!fresh.is_registered(EventKind::NewPost));

    server.send_event("receive_message", receive_message_frame("m1"));
    let event = timeout(Duration::from_secs(5), kept.recv())
        .await
        .expect("delivered")
        .expect("open");
    assert!(matches!(event, InboundEvent::ReceiveMessage(_)));
}

#[tokio::test]
async fn off_stops_future_delivery() {
    let (channel, _transport, server, _servers) = connected_channel("u1", quiet_settings()).await;
    let mut scope = channel.scope("test");
    scope.on(EventKind::UserTyping);
    scope.on(EventKind::UserStopTyping);
    assert!(scope.off(EventKind::UserTyping));
    assert!(!scope.off(EventKind::UserTyping));

    server.send_event(
        "user_typing",
        json!({"conversationId": "c1", "userId": "u2"}),
    );
    server.send_event(
        "user_stop_typing",
        json!({"conversationId": "c1", "userId": "u2"}),
    );

    let event = timeout(Duration::from_secs(5), scope.recv())
        .await
        .expect("delivered")
        .expect("open");
    assert!(matches!(event, InboundEvent::UserStopTyping(_)));
    assert!(scope.try_recv().is_none());
}

#[tokio::test]
async fn off_discards_events_already_queued() {
    let (channel, _transport, _server, _servers) = connected_channel("u1", quiet_settings()).await;
    let mut scope = channel.scope("test");
    scope.on(EventKind::UserTyping);
    scope.on(EventKind::UserStopTyping);

    let notice = json!({"conversationId": "c1", "userId": "u2"});
    channel.deliver(InboundEvent::decode("user_typing", notice.clone()));
    channel.deliver(InboundEvent::decode("user_stop_typing", notice.clone()));
    channel.deliver(InboundEvent::decode("user_typing", notice));
    assert!(scope.off(EventKind::UserTyping));

    let event = scope.try_recv().expect("stop_typing still delivered");
    assert!(matches!(event, InboundEvent::UserStopTyping(_)));
    assert!(scope.try_recv().is_none());
}

#[tokio::test]
async fn malformed_and_unknown_events_are_dropped() {
    let (channel, _transport, server, _servers) = connected_channel("u1", quiet_settings()).await;
    let mut scope = channel.scope("test");
    scope.on(EventKind::ReceiveMessage);

    server.send_raw("{not json");
    server.send_event("receive_message", json!({"_id": "m0", "content": "no sender"}));
    server.send_event("presence", json!({"online": true}));
    server.send_event("receive_message", receive_message_frame("m1"));

    let event = timeout(Duration::from_secs(5), scope.recv())
        .await
        .expect("delivered")
        .expect("open");
    match event {
        InboundEvent::ReceiveMessage(message) => assert_eq!(message.id.as_str(), "m1"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(channel.is_connected());
}

#[tokio::test]
async fn reconnects_after_transport_drop_and_fails_pending_acks() {
    let (channel, transport, mut server, mut servers) =
        connected_channel("u1", quiet_settings()).await;
    let mut signals = channel.signals();

    let pending = tokio::spawn({
        let channel = channel.clone();
        async move {
            channel
                .emit_with_ack(OutboundEvent::Heartbeat, Duration::from_secs(5))
                .await
        }
    });
    assert_eq!(server.next_frame().await["event"], "heartbeat");
    drop(server);

    let err = pending.await.expect("join").expect_err("link dropped");
    assert!(matches!(err, ChannelError::Transport(_)));

    assert_eq!(
        wait_for_signal(&mut signals, |_| true).await,
        ChannelSignal::Reconnecting { attempt: 1 }
    );
    wait_for_signal(&mut signals, |s| *s == ChannelSignal::ConnectionRestored).await;

    let mut server = servers.recv().await.expect("new server end");
    server.expect_event("join").await;
    assert_eq!(transport.opens(), 2);
    assert!(channel.is_connected());
}

#[tokio::test]
async fn gives_up_after_reconnect_ceiling() {
    let (channel, transport, server, _servers) = connected_channel("u1", quiet_settings()).await;
    let mut signals = channel.signals();
    for _ in 0..3 {
        transport.script(HandshakeScript::RefuseOpen);
    }

    drop(server);

    let signal = wait_for_signal(&mut signals, |s| {
        matches!(s, ChannelSignal::Disconnected { .. })
    })
    .await;
    assert!(matches!(signal, ChannelSignal::Disconnected { reason } if reason.contains('3')));
    assert_eq!(transport.opens(), 4);
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn auth_rejection_during_reconnect_is_fatal() {
    let (channel, transport, server, _servers) = connected_channel("u1", quiet_settings()).await;
    let mut signals = channel.signals();
    transport.script(HandshakeScript::Reject {
        message: "token revoked",
        code: "unauthorized",
    });

    drop(server);

    wait_for_signal(&mut signals, |s| {
        matches!(s, ChannelSignal::AuthRejected { .. })
    })
    .await;
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeats_degrade_once_without_disconnecting() {
    let settings = ChannelSettings {
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_miss_threshold: 2,
        ..quiet_settings()
    };
    let (channel, _transport, _server, _servers) = connected_channel("u1", settings).await;
    let mut signals = channel.signals();

    let signal = wait_for_signal(&mut signals, |s| {
        matches!(s, ChannelSignal::ConnectionDegraded { .. })
    })
    .await;
    assert_eq!(signal, ChannelSignal::ConnectionDegraded { missed: 2 });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(matches!(
        signals.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(channel.is_connected());
    assert!(channel.session().missed_heartbeats >= 2);
}

#[tokio::test(start_paused = true)]
async fn acknowledged_heartbeat_records_timestamp() {
    let settings = ChannelSettings {
        heartbeat_interval: Duration::from_secs(1),
        ..quiet_settings()
    };
    let (channel, _transport, mut server, _servers) = connected_channel("u1", settings).await;
    assert!(channel.session().last_heartbeat.is_none());

    let frame = server.next_frame().await;
    assert_eq!(frame["event"], "heartbeat");
    server.ack(&frame, json!({}));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let session = channel.session();
    assert!(session.last_heartbeat.is_some());
    assert_eq!(session.missed_heartbeats, 0);
}

#[tokio::test]
async fn close_announces_manual_disconnect_and_does_not_reconnect() {
    let (channel, transport, mut server, _servers) =
        connected_channel("u1", quiet_settings()).await;
    let mut signals = channel.signals();

    channel.close();
    channel.close();

    server.expect_event("manual-disconnect").await;
    assert_eq!(signals.recv().await.expect("signal"), ChannelSignal::Closed);
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        channel.emit(OutboundEvent::Heartbeat),
        Err(ChannelError::NotConnected)
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.opens(), 1);
    assert!(matches!(
        signals.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}
