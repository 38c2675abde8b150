//! Raw TCP transport for device sessions.
//!
//! Each line on the socket is one JSON object (newline-delimited JSON), which
//! suits firmware without a WebSocket client. Lines are framed as raw bytes so
//! a line that is not UTF-8 gets an error frame like any malformed message. A
//! line longer than `session.max_frame_bytes` closes the connection.

use std::sync::Arc;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{AnyDelimiterCodec, Framed};
use tracing::{info, warn};

use crate::connection;
use crate::state::AppState;

/// Accept device connections until the service shuts down.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    match listener.local_addr() {
        Ok(addr) => info!("Accepting device connections on tcp://{}", addr),
        Err(e) => warn!("TCP listener has no local address: {}", e),
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    state
                        .connections
                        .spawn(handle_stream(stream, Arc::clone(&state), peer.to_string()));
                }
                Err(e) => warn!("Failed to accept TCP connection: {}", e),
            },
        }
    }

    info!("TCP listener stopped");
}

async fn handle_stream(stream: TcpStream, state: Arc<AppState>, peer: String) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let codec = AnyDelimiterCodec::new_with_max_length(
        b"\n".to_vec(),
        b"\n".to_vec(),
        state.config.session.max_frame_bytes,
    );
    let (sink, frames) = Framed::new(stream, codec).split();

    connection::serve(state, peer, frames, sink).await;
}
