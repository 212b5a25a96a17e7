use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use tandem_types::events::ClientCommand;

use crate::auth::Identity;
use crate::chat::ChatService;
use crate::error::ChatError;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// What the receive loop should do after a command.
enum Flow {
    Continue,
    Close,
}

/// Handle an authenticated WebSocket connection.
/// The credential was already validated at the HTTP upgrade layer, so the
/// connection joins its room straight away.
pub async fn handle_connection(socket: WebSocket, chat: ChatService, identity: Identity) {
    let (mut sender, receiver) = socket.split();
    let Identity { user_id, name } = identity;
    let dispatcher = chat.dispatcher().clone();

    // Subscribe before joining so our own presence snapshot reaches us too.
    let mut broadcast_rx = dispatcher.subscribe();
    let (conn_id, mut user_rx) = dispatcher.connect(user_id).await;

    info!("{} ({}) connected to gateway [conn={}]", name, user_id, conn_id);

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Forward broadcasts + room events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let event = tokio::select! {
                result = broadcast_rx.recv() => match result {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Broadcast receiver lagged by {} messages", n);
                        continue;
                    }
                    Err(_) => break,
                },
                result = user_rx.recv() => match result {
                    Some(event) => event,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode server event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Read commands from client; one at a time, so they run in send order
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut recv_task = tokio::spawn(run_commands(
        receiver,
        stop_rx,
        chat.clone(),
        user_id,
        conn_id,
        name.clone(),
        pong_flag_recv,
    ));

    // Wait for either task to finish. A dead send side only stops the reader
    // from taking new frames; the command in progress still runs to the end.
    tokio::select! {
        _ = &mut send_task => {
            let _ = stop_tx.send(());
            if let Err(e) = (&mut recv_task).await {
                warn!("Command loop of {} ended abnormally: {}", user_id, e);
            }
        }
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway [conn={}]", name, user_id, conn_id);
}

/// Handle client frames until the stream ends, the client closes or `stop`
/// fires. `stop` is only checked between frames.
async fn run_commands<S>(
    mut frames: S,
    mut stop: oneshot::Receiver<()>,
    chat: ChatService,
    user_id: Uuid,
    conn_id: Uuid,
    name: String,
    pong_received: Arc<AtomicBool>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => break,
            frame = frames.next() => frame,
        };
        let Some(Ok(msg)) = frame else { break };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(cmd) => {
                    if let Flow::Close = handle_command(&chat, user_id, conn_id, &name, cmd).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        "{} ({}) bad command: {} -- raw: {}",
                        name,
                        user_id,
                        e,
                        text.chars().take(200).collect::<String>()
                    );
                }
            },
            Message::Pong(_) => {
                pong_received.store(true, Ordering::Release);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_command(
    chat: &ChatService,
    user_id: Uuid,
    conn_id: Uuid,
    name: &str,
    cmd: ClientCommand,
) -> Flow {
    let event = cmd.name();

    let result = match cmd {
        ClientCommand::MessagePage(peer) => {
            info!("{} ({}) opened page of {}", name, user_id, peer);
            chat.open_page(user_id, conn_id, peer).await
        }

        ClientCommand::NewMessage(msg) => chat.send(user_id, msg).await.map(|_| ()),

        ClientCommand::Seen(counterparty) => chat.mark_seen(user_id, counterparty).await,

        ClientCommand::Sidebar(requested) => chat.refresh_sidebar(user_id, conn_id, requested).await,

        ClientCommand::Disconnect => return Flow::Close,
    };

    if let Err(e) = result {
        report_failure(chat, user_id, conn_id, name, event, e).await;
    }
    Flow::Continue
}

async fn report_failure(
    chat: &ChatService,
    user_id: Uuid,
    conn_id: Uuid,
    name: &str,
    event: &str,
    err: ChatError,
) {
    warn!("{} ({}) {} failed: {}", name, user_id, event, err);
    chat.dispatcher()
        .send_to_connection(user_id, conn_id, err.to_event(event))
        .await;
}
