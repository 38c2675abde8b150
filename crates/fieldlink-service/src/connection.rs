//! Transport-independent connection loop.
//!
//! [`serve`] drives one device connection: it feeds inbound text frames to a
//! [`Session`], writes replies, delivers commands queued through the
//! [`SessionRegistry`](crate::registry::SessionRegistry), closes connections
//! that do not authenticate in time and stops when the service shuts down.
//! Frames are handled strictly one after another; a frame that is being
//! handled always finishes before any of those events is observed.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use fieldlink_types::Outbound;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::session::{Action, DeviceGateway, Session};
use crate::state::AppState;

/// Commands that may be queued for one device before senders wait.
const COMMAND_BUFFER: usize = 16;

/// Why a connection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    PeerClosed,
    /// Reading or writing failed.
    TransportError,
    /// The device presented an unknown token.
    Unauthorized,
    /// No successful auth within the configured timeout.
    AuthTimeout,
    /// The service is shutting down.
    Shutdown,
}

/// Run the session loop for one connection until it closes.
///
/// `frames` yields inbound frames (text or raw bytes); `sink` accepts encoded
/// outbound frames.
pub async fn serve<S, F, E, K>(state: Arc<AppState>, peer: String, frames: S, sink: K) -> CloseReason
where
    S: Stream<Item = Result<F, E>> + Unpin,
    F: AsRef<[u8]>,
    E: Display,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let connection_id = Uuid::new_v4();
    let span = info_span!("device_conn", conn = %connection_id, peer = %peer);
    run(state, connection_id, frames, sink).instrument(span).await
}

async fn run<S, F, E, K>(
    state: Arc<AppState>,
    connection_id: Uuid,
    mut frames: S,
    mut sink: K,
) -> CloseReason
where
    S: Stream<Item = Result<F, E>> + Unpin,
    F: AsRef<[u8]>,
    E: Display,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let _guard = state.registry.connect();
    info!("Device connection opened");

    let gateway: Arc<dyn DeviceGateway> = state.clone();
    let mut session = Session::new(gateway, state.config.session.max_frame_bytes);

    let (command_tx, mut commands) = mpsc::channel::<Outbound>(COMMAND_BUFFER);
    let auth_timeout = Duration::from_secs(state.config.session.auth_timeout_secs);
    let auth_deadline = tokio::time::sleep(auth_timeout);
    tokio::pin!(auth_deadline);

    let reason = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break CloseReason::Shutdown,
            _ = &mut auth_deadline, if !session.is_authenticated() => {
                warn!("No successful auth within {}s, closing", auth_timeout.as_secs());
                break CloseReason::AuthTimeout;
            }
            Some(command) = commands.recv() => {
                debug!("Delivering queued command");
                if let Err(e) = send_frame(&mut sink, &command).await {
                    warn!("Failed to deliver command: {}", e);
                    break CloseReason::TransportError;
                }
            }
            frame = frames.next() => {
                let frame = match frame {
                    None => break CloseReason::PeerClosed,
                    Some(Err(e)) => {
                        warn!("Read failed: {}", e);
                        break CloseReason::TransportError;
                    }
                    Some(Ok(frame)) => frame,
                };

                let (reply, close) = match session.handle_frame(frame.as_ref()).await {
                    Action::None => (None, false),
                    Action::Reply(reply) => (Some(reply), false),
                    Action::Authorized { device_id, reply } => {
                        if let Some(previous) = state
                            .registry
                            .register(device_id, connection_id, command_tx.clone())
                            .await
                        {
                            info!("Device {} reconnected, replacing connection {}", device_id, previous);
                        }
                        (Some(reply), false)
                    }
                    Action::Close(reply) => (Some(reply), true),
                };

                if let Some(reply) = reply
                    && let Err(e) = send_frame(&mut sink, &reply).await
                {
                    warn!("Write failed: {}", e);
                    break CloseReason::TransportError;
                }
                if close {
                    break CloseReason::Unauthorized;
                }
            }
        }
    };

    if let Some(device_id) = session.device_id() {
        state.registry.unregister(device_id, connection_id).await;
    }
    session.close();
    let _ = sink.close().await;

    info!("Device connection closed ({:?})", reason);
    reason
}

async fn send_frame<K>(sink: &mut K, frame: &Outbound) -> Result<(), String>
where
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let text = frame.encode().map_err(|e| e.to_string())?;
    sink.send(text).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_store::{NewDevice, Store};
    use fieldlink_types::{RelayState, Reply};
    use futures::channel::mpsc as fmpsc;

    use crate::config::Config;

    type Frames = fmpsc::UnboundedReceiver<Result<String, std::io::Error>>;

    async fn state_with_device(auth_timeout_secs: u64) -> (Arc<AppState>, i64) {
        let store = Store::open_in_memory().unwrap();
        let account = store.create_account("farmer", "f@example.com", "h").unwrap();
        let device = store
            .create_device(&NewDevice {
                account_id: account.id,
                name: "greenhouse",
                device_type: None,
                token: "T1",
            })
            .unwrap();
        let mut config = Config::default();
        config.session.auth_timeout_secs = auth_timeout_secs;
        (AppState::new(store, config), device.id)
    }

    fn pipes() -> (
        fmpsc::UnboundedSender<Result<String, std::io::Error>>,
        Frames,
        fmpsc::UnboundedSender<String>,
        fmpsc::UnboundedReceiver<String>,
    ) {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        (in_tx, in_rx, out_tx, out_rx)
    }

    fn decode(text: &str) -> Outbound {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_token_closes_connection() {
        let (state, _) = state_with_device(30).await;
        let (in_tx, in_rx, out_tx, mut out_rx) = pipes();

        in_tx
            .unbounded_send(Ok(r#"{"type":"auth","device_token":"BAD"}"#.to_string()))
            .unwrap();
        let reason = serve(state.clone(), "test".to_string(), in_rx, out_tx).await;

        assert_eq!(reason, CloseReason::Unauthorized);
        let frame = out_rx.next().await.unwrap();
        assert_eq!(decode(&frame), Outbound::Reply(Reply::Unauthorized));
        assert!(out_rx.next().await.is_none());
        assert_eq!(state.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_unregisters_device() {
        let (state, device_id) = state_with_device(30).await;
        let (in_tx, in_rx, out_tx, mut out_rx) = pipes();

        let task = tokio::spawn(serve(state.clone(), "test".to_string(), in_rx, out_tx));
        in_tx
            .unbounded_send(Ok(r#"{"type":"auth","device_token":"T1"}"#.to_string()))
            .unwrap();

        let frame = out_rx.next().await.unwrap();
        assert_eq!(
            decode(&frame),
            Outbound::Reply(Reply::Authorized { device_id })
        );
        assert!(state.registry.is_connected(device_id).await);

        state
            .registry
            .send(device_id, Outbound::relay(RelayState::On))
            .await
            .unwrap();
        let frame = out_rx.next().await.unwrap();
        assert_eq!(decode(&frame), Outbound::relay(RelayState::On));

        drop(in_tx);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
        assert!(!state.registry.is_connected(device_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_closes_silently() {
        let (state, _) = state_with_device(5).await;
        let (_in_tx, in_rx, out_tx, mut out_rx) = pipes();

        let reason = serve(state, "test".to_string(), in_rx, out_tx).await;

        assert_eq!(reason, CloseReason::AuthTimeout);
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticated_session_outlives_auth_timeout() {
        let (state, _) = state_with_device(5).await;
        let (in_tx, in_rx, out_tx, mut out_rx) = pipes();

        let task = tokio::spawn(serve(state.clone(), "test".to_string(), in_rx, out_tx));
        in_tx
            .unbounded_send(Ok(r#"{"type":"auth","device_token":"T1"}"#.to_string()))
            .unwrap();
        out_rx.next().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!task.is_finished());

        state.shutdown.cancel();
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
    }
}
