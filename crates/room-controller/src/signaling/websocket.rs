//! WebSocket endpoint (`GET /ws`).
//!
//! Each socket gets a UUID connection id, a writer task that serializes
//! [`OutboundFrame`]s onto the socket, and a [`SignalingDispatcher`] fed by
//! the read half. The writer closes the socket after an `evicted` frame.

use super::dispatcher::{SignalingContext, SignalingDispatcher};
use super::protocol::OutboundFrame;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames queued for one socket writer.
const OUTBOUND_BUFFER: usize = 256;

/// Router serving the signaling WebSocket.
pub fn signaling_router(context: SignalingContext) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(context)
}

async fn ws_handler(ws: WebSocketUpgrade, State(context): State<SignalingContext>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

async fn handle_socket(socket: WebSocket, context: SignalingContext) {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

    let writer_done = CancellationToken::new();
    let writer = tokio::spawn(run_writer(
        sink,
        outbound_rx,
        connection_id.clone(),
        writer_done.clone(),
    ));

    info!(
        target: "rc.signaling",
        connection_id = %connection_id,
        "WebSocket connected"
    );

    let mut dispatcher = SignalingDispatcher::new(connection_id.clone(), context, outbound_tx);

    loop {
        tokio::select! {
            () = writer_done.cancelled() => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %connection_id,
                    "Writer finished, closing socket"
                );
                break;
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatcher.handle_text(&text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(
                            target: "rc.signaling",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket receive error"
                        );
                        break;
                    }
                    // Binary frames are not part of the protocol; ping/pong
                    // is answered by axum.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    dispatcher.close().await;
    writer.abort();

    info!(
        target: "rc.signaling",
        connection_id = %connection_id,
        "WebSocket disconnected"
    );
}

/// Drain `outbound` onto the socket until eviction, a send failure or every
/// sender is gone.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    connection_id: String,
    done: CancellationToken,
) {
    while let Some(frame) = outbound.recv().await {
        let evicted = frame.event.is_eviction();
        match frame.to_json() {
            Ok(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    debug!(
                        target: "rc.signaling",
                        connection_id = %connection_id,
                        "Socket send failed"
                    );
                    break;
                }
            }
            Err(e) => {
                warn!(
                    target: "rc.signaling",
                    connection_id = %connection_id,
                    error = %e,
                    "Dropping unserializable frame"
                );
            }
        }
        if evicted {
            break;
        }
    }

    let _ = sink.close().await;
    done.cancel();
}
