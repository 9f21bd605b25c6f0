use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::domain::UserId;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

/// Both directions of one open connection, as text frames.
///
/// Dropping `outbound` closes the connection; `inbound` yields `None` once the
/// remote end is gone.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn open(&self, user_id: &UserId, token: &str) -> Result<TransportLink>;
}

pub struct WebSocketTransport {
    server_url: String,
}

impl WebSocketTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }
}

pub fn websocket_url(server_url: &str, user_id: &UserId) -> Result<Url> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    let mut url = Url::parse(&format!("{}/ws", ws_base.trim_end_matches('/')))
        .with_context(|| format!("invalid server_url: {server_url}"))?;
    url.query_pairs_mut()
        .append_pair("user_id", user_id.as_str());
    Ok(url)
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn open(&self, user_id: &UserId, token: &str) -> Result<TransportLink> {
        let url = websocket_url(&self.server_url, user_id)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .context("failed to build websocket request")?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .context("auth token is not a valid header value")?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(frame)).await {
                    warn!(error = %err, "websocket: write failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "websocket: closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "websocket: read failed");
                        break;
                    }
                }
            }
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
