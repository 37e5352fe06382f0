use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};

use chatter_db::Database;
use chatter_types::events::{ClientEvent, ServerEvent};

use crate::dispatcher::Dispatcher;
use crate::handlers;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Truncate an unparseable frame for logging. Walks back to a char boundary
/// so a multibyte character straddling the cutoff cannot panic the recv task.
fn frame_preview(text: &str) -> &str {
    let mut end = text.len().min(200);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Own one client connection from upgrade to cleanup. The connection gets an
/// opaque server-assigned identity; every inbound frame is parsed into a
/// typed `ClientEvent` and routed through the handler table; connection loss
/// always runs the disconnect cleanup, exactly once per live session row.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, db: Arc<Database>) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut rx) = dispatcher.register().await;
    info!("connection {} opened", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("event serialization failed: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read requests from the client
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => {
                            handlers::dispatch(&db_recv, &dispatcher_recv, conn_id, event).await;
                        }
                        Err(e) => {
                            warn!(
                                "connection {} bad request: {} -- raw: {}",
                                conn_id,
                                e,
                                frame_preview(&text)
                            );
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister(conn_id).await;

    // Disconnect cleanup: session removal and room clearing are one store
    // unit; the refreshed distinct online list is read back inside it and
    // broadcast to everyone still connected. A duplicate disconnect finds no
    // session and does nothing.
    let cleanup_db = db.clone();
    match tokio::task::spawn_blocking(move || cleanup_db.cleanup_connection(conn_id)).await {
        Ok(Ok(Some(cleanup))) => {
            info!("{} disconnected (connection {})", cleanup.user_name, conn_id);
            dispatcher
                .broadcast(ServerEvent::OnlineUsers {
                    names: cleanup.online,
                })
                .await;
        }
        Ok(Ok(None)) => {
            info!("connection {} closed", conn_id);
        }
        Ok(Err(e)) => {
            error!("disconnect cleanup failed for connection {}: {:#}", conn_id, e);
        }
        Err(e) => {
            error!("disconnect cleanup task join error for connection {}: {}", conn_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_preview_respects_char_boundaries() {
        // 100 three-byte chars = 300 bytes; byte 200 is mid-character
        let text = "あ".repeat(100);
        let preview = frame_preview(&text);
        assert!(preview.len() <= 200);
        assert!(text.is_char_boundary(preview.len()));
        assert_eq!(preview.chars().count(), 66);
    }

    #[test]
    fn test_frame_preview_keeps_short_frames_whole() {
        assert_eq!(frame_preview("not json"), "not json");
        assert_eq!(frame_preview(""), "");
    }
}
