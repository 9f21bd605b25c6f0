use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    load_settings, CallEvent, ClientEvent, HttpConversationDirectory, MemoryFeed,
    MemoryNotifications, RealtimeSession, SessionDependencies, WebSocketTransport,
};
use peer_integration::{MissingMediaDevices, MissingPeerConnector};
use shared::{
    domain::{CallKind, ConversationId, PostId, UserId},
    protocol::{NotificationKind, NotificationRequest},
};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// TOML settings file; `REALTIME__*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let session = RealtimeSession::new(
        &settings,
        UserId::from(args.user_id.as_str()),
        SessionDependencies {
            transport: Arc::new(WebSocketTransport::new(&settings.server_url)),
            directory: Arc::new(HttpConversationDirectory::new(
                &settings.api_url,
                &args.token,
            )),
            media: Arc::new(MissingMediaDevices),
            peers: Arc::new(MissingPeerConnector),
            feed: Some(MemoryFeed::new()),
            notifications: Some(MemoryNotifications::new()),
        },
    );

    let printer = tokio::spawn(print_events(session.subscribe_events()));
    session
        .open(&args.token)
        .await
        .context("failed to open realtime session")?;
    println!("connected as {}; type /help for commands", session.user_id());

    let mut open: Option<ConversationId> = None;
    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&session, &mut open, line).await {
            println!("error: {err:#}");
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}

async fn run_command(
    session: &Arc<RealtimeSession>,
    open: &mut Option<ConversationId>,
    line: &str,
) -> Result<()> {
    if !line.starts_with('/') {
        let Some(conversation_id) = open.as_ref() else {
            bail!("no open conversation; use /open <conversation-id>");
        };
        let message = session.messages().send(conversation_id, line).await?;
        println!("sent {}", message.key);
        return Ok(());
    }
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();

    match command {
        "/help" => println!(
            "/convs | /open <id> | /read | /call <user> [video] | /accept | /decline | /hangup | /mute | /camera | /like <user> <post> | /quit"
        ),
        "/convs" => {
            for conversation in session.messages().conversations().await {
                println!(
                    "{} unread={} with={}",
                    conversation.id,
                    conversation.unread_count,
                    conversation
                        .other_participant(session.user_id())
                        .map(|p| p.username.as_str())
                        .unwrap_or("?")
                );
            }
        }
        "/open" => {
            let id = ConversationId::from(parts.next().context("usage: /open <id>")?);
            session.messages().open_conversation(&id).await?;
            for message in session.messages().messages(&id).await {
                println!("[{}] {}: {}", message.key, message.sender_id, message.content);
            }
            *open = Some(id);
        }
        "/read" => {
            let id = open.as_ref().context("no open conversation")?;
            let marked = session.messages().mark_all_read(id).await;
            println!("marked {marked} read");
        }
        "/call" => {
            let callee = UserId::from(parts.next().context("usage: /call <user> [video]")?);
            let kind = match parts.next() {
                Some("video") => CallKind::Video,
                _ => CallKind::Audio,
            };
            session.calls().initiate(callee, kind).await?;
        }
        "/accept" => session.calls().accept().await?,
        "/decline" => session.calls().decline().await?,
        "/hangup" => session.calls().hang_up().await?,
        "/mute" => {
            let enabled = session.calls().toggle_audio().await?;
            println!("microphone {}", if enabled { "on" } else { "muted" });
        }
        "/camera" => {
            let enabled = session.calls().toggle_video().await?;
            println!("camera {}", if enabled { "on" } else { "off" });
        }
        "/like" => {
            let receiver = parts.next().context("usage: /like <user> <post>")?;
            let post = parts.next().context("usage: /like <user> <post>")?;
            session.send_notification(NotificationRequest {
                kind: NotificationKind::Like,
                receiver_id: UserId::from(receiver),
                post_id: Some(PostId::from(post)),
                comment_text: None,
            })?;
        }
        other => bail!("unknown command {other}"),
    }
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "desktop: event printer lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        match event {
            ClientEvent::MessageReceived(message) => {
                println!("[{}] {}: {}", message.conversation_id, message.sender_id, message.content);
            }
            ClientEvent::MessageRolledBack { temp_id, error, .. } => {
                println!("message {temp_id} not delivered: {}", error.message);
            }
            ClientEvent::TypingChanged { conversation_id, users } if !users.is_empty() => {
                let names: Vec<_> = users.iter().map(ToString::to_string).collect();
                println!("[{conversation_id}] {} typing...", names.join(", "));
            }
            ClientEvent::Call(CallEvent::Incoming { room_id, caller, kind }) => {
                println!("incoming {kind:?} call from {} (room {room_id}); /accept or /decline", caller.id());
            }
            ClientEvent::Call(CallEvent::Ended { reason, .. }) => println!("call ended: {reason:?}"),
            ClientEvent::Call(CallEvent::PhaseChanged { phase, .. }) => println!("call {phase:?}"),
            ClientEvent::NotificationReceived(notification) => {
                println!("notification: {} from {:?}", notification.kind, notification.sender.as_ref().map(|s| s.id().to_string()));
            }
            ClientEvent::Connection(signal) => println!("connection: {signal:?}"),
            ClientEvent::SignedOut => {
                println!("signed out: credentials rejected");
                return;
            }
            ClientEvent::Error(error) => println!("error: {}", error.message),
            _ => {}
        }
    }
}
