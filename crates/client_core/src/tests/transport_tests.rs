use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc, time::timeout};

use super::*;
use crate::channel::{ChannelSettings, EventChannel};

#[derive(Debug)]
struct Seen {
    user_id: Option<String>,
    authorization: Option<String>,
    frames: Vec<Value>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(seen): State<mpsc::UnboundedSender<Seen>>,
) -> impl IntoResponse {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let user_id = query.get("user_id").cloned();
    ws.on_upgrade(move |socket| serve_socket(socket, user_id, authorization, seen))
}

async fn serve_socket(
    mut socket: WebSocket,
    user_id: Option<String>,
    authorization: Option<String>,
    seen: mpsc::UnboundedSender<Seen>,
) {
    let _ = socket
        .send(WsMessage::Text(json!({"event": "connect"}).to_string()))
        .await;

    let mut frames = Vec::new();
    while let Some(Ok(WsMessage::Text(text))) = socket.recv().await {
        let frame: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if let Some(id) = frame.get("ack").and_then(Value::as_u64) {
            let reply = json!({"event": "ack", "ack": id, "data": {"status": "success", "messageId": "m42"}});
            let _ = socket.send(WsMessage::Text(reply.to_string())).await;
        }
        let done = frame["event"] == "manual-disconnect";
        frames.push(frame);
        if done {
            break;
        }
    }
    let _ = seen.send(Seen {
        user_id,
        authorization,
        frames,
    });
}

#[test]
fn websocket_url_swaps_scheme_and_appends_user() {
    let url = websocket_url("https://social.example/", &UserId::from("u 1")).expect("url");
    assert_eq!(url.as_str(), "wss://social.example/ws?user_id=u+1");

    let url = websocket_url("http://localhost:5001", &UserId::from("u1")).expect("url");
    assert_eq!(url.as_str(), "ws://localhost:5001/ws?user_id=u1");

    assert!(websocket_url("ftp://nope", &UserId::from("u1")).is_err());
}

#[tokio::test]
async fn websocket_transport_carries_handshake_and_acks() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(seen_tx);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let transport = Arc::new(WebSocketTransport::new(format!("http://{addr}")));
    let channel = EventChannel::new(UserId::from("u1"), ChannelSettings::default(), transport);
    channel.connect("secret").await.expect("connect");

    let ack = channel
        .emit_with_ack(
            shared::protocol::OutboundEvent::SendMessage(shared::protocol::SendMessagePayload {
                content: "hi".into(),
                conversation: "c1".into(),
            }),
            Duration::from_secs(5),
        )
        .await
        .expect("ack");
    assert_eq!(ack["messageId"], "m42");

    channel.close();

    let seen = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("server finished")
        .expect("report");
    assert_eq!(seen.user_id.as_deref(), Some("u1"));
    assert_eq!(seen.authorization.as_deref(), Some("Bearer secret"));
    let events: Vec<&str> = seen
        .frames
        .iter()
        .filter_map(|f| f["event"].as_str())
        .collect();
    assert_eq!(events, vec!["join", "send_message", "manual-disconnect"]);
}
