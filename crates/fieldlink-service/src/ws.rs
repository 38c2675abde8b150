//! WebSocket transport for device sessions.
//!
//! Devices connect to `GET /ws` and exchange one JSON object per text frame.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt, future};
use tracing::debug;

use crate::connection;
use crate::state::AppState;

/// Create the WebSocket router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.session.max_frame_bytes * 4)
        .on_upgrade(move |socket| {
            let tracker = state.connections.clone();
            tracker.track_future(handle_socket(socket, state, peer.to_string()))
        })
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, peer: String) {
    let (sender, receiver) = socket.split();

    // Text frames carry messages; pings are answered by axum and binary
    // frames have no meaning in this protocol.
    let frames = receiver.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(text.to_string())),
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame");
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    });

    let sink = sender.with(|text: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    });

    connection::serve(state, peer, Box::pin(frames), Box::pin(sink)).await;
}
