//! WebSocket endpoints.
//!
//! - `GET /ws/rooms/:room_id?token=&name=&password=` - participant signaling
//! - `GET /ws/meetings/:meeting_id/host?token=` - host waiting-room channel
//!
//! Each socket is split into a reader that decodes text frames into the
//! signaling handler's inbound channel and a writer task that drains its
//! bounded outbound channel. The handler owns the connection: when it
//! returns the outbound channel closes and the writer closes the socket.

use crate::routes::AppState;
use crate::signaling::{
    run_host_channel, run_session, ConnectRequest, HostClientMessage, HostServerMessage, Inbound,
    ServerMessage,
};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use common::types::{MeetingId, RoomId};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Inbound frames buffered between the socket reader and the handler.
const INBOUND_BUFFER: usize = 32;

#[derive(Debug, Default, Deserialize)]
pub struct RoomQuery {
    pub token: Option<String>,
    pub name: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HostQuery {
    pub token: Option<String>,
}

/// Handler for `GET /ws/rooms/:room_id`.
pub async fn room_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<RoomQuery>,
) -> Response {
    let outbound_buffer = state.config.outbound_buffer;
    ws.max_message_size(state.config.max_message_bytes)
        .on_failed_upgrade(|error| {
            warn!(target: "rs.ws", error = %error, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            let request = ConnectRequest {
                room_id: RoomId::from(room_id),
                token: query.token,
                display_name: query.name,
                password: query.password,
            };
            let ctx = state.signaling.clone();
            bridge::<_, ServerMessage, _, _>(socket, outbound_buffer, move |inbound, outbound| {
                run_session(ctx, request, inbound, outbound)
            })
            .await;
        })
}

/// Handler for `GET /ws/meetings/:meeting_id/host`.
pub async fn host_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(meeting_id): Path<MeetingId>,
    Query(query): Query<HostQuery>,
) -> Response {
    let outbound_buffer = state.config.outbound_buffer;
    ws.max_message_size(state.config.max_message_bytes)
        .on_failed_upgrade(|error| {
            warn!(target: "rs.ws", error = %error, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            let ctx = state.signaling.clone();
            bridge::<HostClientMessage, HostServerMessage, _, _>(
                socket,
                outbound_buffer,
                move |inbound, outbound| run_host_channel(ctx, meeting_id, query.token, inbound, outbound),
            )
            .await;
        })
}

/// Wire a socket to a channel-based handler and run both until the handler
/// returns or the peer goes away.
async fn bridge<In, Out, F, Fut>(socket: WebSocket, outbound_buffer: usize, handler: F)
where
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    F: FnOnce(mpsc::Receiver<Inbound<In>>, mpsc::Sender<Out>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let (sink, stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let (outbound_tx, outbound_rx) = mpsc::channel(outbound_buffer.max(1));

    let writer = tokio::spawn(write_frames(sink, outbound_rx));
    let reader = tokio::spawn(read_frames(stream, inbound_tx));

    handler(inbound_rx, outbound_tx).await;

    // The handler dropped its sender; the writer flushes and closes.
    reader.abort();
    if let Err(e) = writer.await {
        debug!(target: "rs.ws", error = %e, "Writer task ended abnormally");
    }
}

async fn read_frames<In: DeserializeOwned>(
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Inbound<In>>,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(Message::Text(text)) => Inbound::decode(&text),
            Ok(Message::Binary(_)) => Inbound::Malformed {
                reason: "binary frames are not supported".to_string(),
            },
            Ok(Message::Close(_)) => break,
            // Ping/pong is answered by the protocol layer.
            Ok(_) => continue,
            Err(e) => {
                debug!(target: "rs.ws", error = %e, "Socket read failed");
                break;
            }
        };
        if inbound.send(frame).await.is_err() {
            break;
        }
    }
}

async fn write_frames<Out: Serialize>(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Out>,
) {
    while let Some(frame) = outbound.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "rs.ws", error = %e, "Failed to encode frame");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            debug!(target: "rs.ws", "Socket closed while writing");
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
