//! WebSocket serving: connection management, frame protocol and per-topic
//! stream workers.

pub mod connection;
pub mod protocol;
pub mod stream;

pub use connection::{ConnectionManager, Outbound};
pub use protocol::{ClientFrame, ServerFrame, StreamInterval, Topic, TopicKind};
pub use stream::StreamService;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Drive one client socket: register with the connection manager, pump
/// outbound frames from the transport channel, and dispatch inbound frames.
pub async fn serve_socket(
    socket: WebSocket,
    manager: Arc<ConnectionManager>,
    streams: Arc<StreamService>,
    client_id: Option<String>,
    user_id: Option<String>,
) {
    let client_id = client_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(64);

    // Writer task: the only place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Owned(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    manager.connect(&client_id, tx, user_id).await;

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(client_id, error = %e, "socket read error");
                break;
            }
        };
        // Any inbound activity counts toward the heartbeat clock.
        manager.touch(&client_id);

        match message {
            Message::Text(text) => {
                handle_client_frame(&client_id, &text, &manager, &streams).await;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Binary(_) => {
                let frame = ServerFrame::Error {
                    error_code: "unsupported_frame".into(),
                    error_message: "binary frames are not part of the protocol".into(),
                };
                manager.send(&client_id, &frame).await;
            }
        }

        if !manager.is_connected(&client_id) {
            // Superseded or swept while we were reading.
            break;
        }
    }

    manager.disconnect(&client_id).await;
    writer.abort();
    let _ = writer.await;
    debug!(client_id, "socket task finished");
}

async fn handle_client_frame(
    client_id: &str,
    text: &str,
    manager: &Arc<ConnectionManager>,
    streams: &Arc<StreamService>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(client_id, error = %e, "unparseable client frame");
            let frame = ServerFrame::Error {
                error_code: "invalid_frame".into(),
                error_message: format!("frame does not parse: {e}"),
            };
            manager.send(client_id, &frame).await;
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe { topic } => {
            if manager.subscribe(client_id, &topic).await {
                streams.ensure_worker(&topic);
            }
        }
        ClientFrame::Unsubscribe { topic } => {
            manager.unsubscribe(client_id, &topic).await;
        }
        ClientFrame::HeartbeatResponse => {
            // touch() already ran for this inbound frame.
        }
        ClientFrame::Ping => {
            let frame = ServerFrame::Pong {
                timestamp: Utc::now().to_rfc3339(),
            };
            manager.send(client_id, &frame).await;
        }
        ClientFrame::GetSubscriptions => {
            let frame = ServerFrame::SubscriptionsList {
                subscriptions: manager.subscriptions_of(client_id),
            };
            manager.send(client_id, &frame).await;
        }
    }
}
