//! Per-connection device session.
//!
//! A [`Session`] is the protocol state machine for one device connection. It
//! is transport-agnostic: the WebSocket and TCP listeners feed it one
//! frame at a time via [`Session::handle_frame`] and act on the returned
//! [`Action`]. Each call makes at most one gateway call and yields at most one
//! outbound frame.
//!
//! ```text
//! Unauthenticated --auth(known token)--> Authenticated { device_id }
//!        |                                      |
//!        +--auth(unknown token)--> Closed <-----+-- disconnect
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use fieldlink_types::{DeviceId, Inbound, Outbound, RelayState, Reply, SensorSample};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// Persistence calls the session depends on.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Resolve a pre-shared token to a device.
    async fn find_device_by_token(&self, token: &str) -> Result<Option<DeviceId>, GatewayError>;

    /// Store one reading and return its id.
    async fn insert_reading(
        &self,
        device_id: DeviceId,
        sample: &SensorSample,
        recorded_at: OffsetDateTime,
    ) -> Result<i64, GatewayError>;
}

/// Persistence failure seen by a session.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The bound device was deleted after the session authenticated.
    #[error("device {0} no longer exists")]
    DeviceGone(DeviceId),
    #[error(transparent)]
    Store(fieldlink_store::Error),
}

impl From<fieldlink_store::Error> for GatewayError {
    fn from(err: fieldlink_store::Error) -> Self {
        match err {
            fieldlink_store::Error::DeviceNotFound(id) => GatewayError::DeviceGone(id),
            other => GatewayError::Store(other),
        }
    }
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { device_id: DeviceId },
    Closed,
}

/// What the transport should do after a frame has been handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing to send.
    None,
    /// Send a frame and keep reading.
    Reply(Outbound),
    /// Authentication succeeded: send the frame and route commands for
    /// `device_id` to this connection.
    Authorized { device_id: DeviceId, reply: Outbound },
    /// Send a frame, then close the connection.
    Close(Outbound),
}

pub(crate) const NOT_AUTHENTICATED: &str = "not authenticated";
pub(crate) const ALREADY_AUTHENTICATED: &str = "already authenticated";
pub(crate) const AUTH_UNAVAILABLE: &str = "authentication temporarily unavailable";

/// Protocol state machine for one device connection.
pub struct Session {
    gateway: Arc<dyn DeviceGateway>,
    state: SessionState,
    max_frame_bytes: usize,
}

impl Session {
    pub fn new(gateway: Arc<dyn DeviceGateway>, max_frame_bytes: usize) -> Self {
        Self {
            gateway,
            state: SessionState::Unauthenticated,
            max_frame_bytes,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The bound device, once authenticated.
    pub fn device_id(&self) -> Option<DeviceId> {
        match self.state {
            SessionState::Authenticated { device_id } => Some(device_id),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.device_id().is_some()
    }

    /// Mark the session closed. Further frames are ignored.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Decode and handle one inbound frame of raw bytes.
    ///
    /// Bytes that are not UTF-8 are a protocol error like any other malformed
    /// payload.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Action {
        if self.state == SessionState::Closed {
            return Action::None;
        }

        match Inbound::decode(frame, self.max_frame_bytes) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                warn!("Rejected frame: {}", e);
                Action::Reply(Outbound::error(e.to_string()))
            }
        }
    }

    /// Handle one decoded message.
    pub async fn handle(&mut self, message: Inbound) -> Action {
        debug!("Handling {} in state {:?}", message.kind(), self.state);

        match (self.state, message) {
            (SessionState::Closed, _) => Action::None,
            (SessionState::Unauthenticated, Inbound::Auth { device_token }) => {
                self.authenticate(&device_token).await
            }
            (SessionState::Authenticated { device_id }, Inbound::Auth { .. }) => {
                warn!("Device {} sent auth on an authenticated session", device_id);
                Action::Reply(Outbound::error(ALREADY_AUTHENTICATED))
            }
            (SessionState::Unauthenticated, Inbound::SensorReading(_)) => {
                debug!("Dropping sensor_reading before auth");
                Action::None
            }
            (SessionState::Authenticated { device_id }, Inbound::SensorReading(sample)) => {
                self.record(device_id, &sample).await
            }
            (SessionState::Unauthenticated, Inbound::ControlRelay { .. }) => {
                Action::Reply(Outbound::error(NOT_AUTHENTICATED))
            }
            (SessionState::Authenticated { device_id }, Inbound::ControlRelay { relay_status }) => {
                self.echo_relay(device_id, relay_status)
            }
        }
    }

    async fn authenticate(&mut self, token: &str) -> Action {
        match self.gateway.find_device_by_token(token).await {
            Ok(Some(device_id)) => {
                info!("Device {} authorized", device_id);
                self.state = SessionState::Authenticated { device_id };
                Action::Authorized {
                    device_id,
                    reply: Reply::Authorized { device_id }.into(),
                }
            }
            Ok(None) => {
                warn!("Rejected unknown device token");
                self.state = SessionState::Closed;
                Action::Close(Reply::Unauthorized.into())
            }
            Err(e) => {
                error!("Token lookup failed: {}", e);
                Action::Reply(Outbound::error(AUTH_UNAVAILABLE))
            }
        }
    }

    async fn record(&mut self, device_id: DeviceId, sample: &SensorSample) -> Action {
        let timestamp = OffsetDateTime::now_utc();
        match self
            .gateway
            .insert_reading(device_id, sample, timestamp)
            .await
        {
            Ok(reading_id) => {
                debug!("Stored reading {} for device {}", reading_id, device_id);
                Action::Reply(Reply::DataReceived { timestamp }.into())
            }
            Err(e) => {
                error!("Dropping reading for device {}: {}", device_id, e);
                Action::None
            }
        }
    }

    fn echo_relay(&self, device_id: DeviceId, relay_status: RelayState) -> Action {
        debug!("Device {} relay -> {}", device_id, relay_status);
        Action::Reply(Outbound::relay(relay_status))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use fieldlink_types::Command;

    /// Gateway call observed by [`RecordingGateway`].
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        FindDevice(String),
        InsertReading(DeviceId, SensorSample),
    }

    /// In-memory gateway that records every call.
    #[derive(Default)]
    pub(crate) struct RecordingGateway {
        devices: Vec<(String, DeviceId)>,
        pub(crate) calls: Mutex<Vec<Call>>,
        pub(crate) readings: Mutex<Vec<(DeviceId, SensorSample, OffsetDateTime)>>,
        fail_lookup: bool,
        fail_insert: bool,
    }

    impl Session {
        async fn handle_text(&mut self, text: &str) -> Action {
            self.handle_frame(text.as_bytes()).await
        }
    }

    impl RecordingGateway {
        pub(crate) fn with_device(token: &str, device_id: DeviceId) -> Self {
            Self {
                devices: vec![(token.to_string(), device_id)],
                ..Default::default()
            }
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceGateway for RecordingGateway {
        async fn find_device_by_token(
            &self,
            token: &str,
        ) -> Result<Option<DeviceId>, GatewayError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::FindDevice(token.to_string()));
            if self.fail_lookup {
                return Err(GatewayError::Store(fieldlink_store::Error::Conflict(
                    "injected".to_string(),
                )));
            }
            Ok(self
                .devices
                .iter()
                .find(|(t, _)| t == token)
                .map(|(_, id)| *id))
        }

        async fn insert_reading(
            &self,
            device_id: DeviceId,
            sample: &SensorSample,
            recorded_at: OffsetDateTime,
        ) -> Result<i64, GatewayError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::InsertReading(device_id, *sample));
            if self.fail_insert {
                return Err(GatewayError::DeviceGone(device_id));
            }
            let mut readings = self.readings.lock().unwrap();
            readings.push((device_id, *sample, recorded_at));
            Ok(readings.len() as i64)
        }
    }

    const READING: &str = r#"{"type":"sensor_reading","temperature":25.3,"humidity":60,
        "light_level":100,"soil_moisture":40,"co2_ppm":410,"rain_analog":0,"relay_status":1}"#;

    fn session_with(gateway: &Arc<RecordingGateway>) -> Session {
        let gateway: Arc<dyn DeviceGateway> = gateway.clone();
        Session::new(gateway, 8192)
    }

    fn auth(token: &str) -> String {
        format!(r#"{{"type":"auth","device_token":"{}"}}"#, token)
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected_and_closes() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);

        let action = session.handle_text(&auth("BAD")).await;
        assert_eq!(action, Action::Close(Reply::Unauthorized.into()));
        assert_eq!(session.state(), SessionState::Closed);

        // Nothing after close reaches the gateway
        assert_eq!(session.handle_text(READING).await, Action::None);
        assert_eq!(gateway.calls(), vec![Call::FindDevice("BAD".to_string())]);
        assert!(gateway.readings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_valid_token_binds_device() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);

        let action = session.handle_text(&auth("T1")).await;
        assert_eq!(
            action,
            Action::Authorized {
                device_id: 42,
                reply: Reply::Authorized { device_id: 42 }.into(),
            }
        );
        assert_eq!(session.state(), SessionState::Authenticated { device_id: 42 });
        assert_eq!(session.device_id(), Some(42));
    }

    #[tokio::test]
    async fn test_second_auth_does_not_rebind() {
        let mut gateway = RecordingGateway::with_device("T1", 42);
        gateway.devices.push(("T2".to_string(), 43));
        let gateway = Arc::new(gateway);
        let mut session = session_with(&gateway);

        session.handle_text(&auth("T1")).await;
        let action = session.handle_text(&auth("T2")).await;

        assert_eq!(action, Action::Reply(Outbound::error(ALREADY_AUTHENTICATED)));
        assert_eq!(session.device_id(), Some(42));
        // The second token was never looked up
        assert_eq!(gateway.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_reading_before_auth_is_dropped() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);

        assert_eq!(session.handle_text(READING).await, Action::None);
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reading_after_auth_is_stored_and_acked() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);
        session.handle_text(&auth("T1")).await;

        let arrival = OffsetDateTime::now_utc();
        let action = session.handle_text(READING).await;

        let Action::Reply(Outbound::Reply(Reply::DataReceived { timestamp })) = action else {
            panic!("expected DataReceived, got {:?}", action);
        };
        assert!(timestamp >= arrival);

        let readings = gateway.readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        let (device_id, sample, recorded_at) = readings[0];
        assert_eq!(device_id, 42);
        assert!((sample.temperature - 25.3).abs() < f64::EPSILON);
        assert_eq!(sample.relay_status, RelayState::On);
        assert_eq!(recorded_at, timestamp);
    }

    #[tokio::test]
    async fn test_control_relay_echoes_without_gateway_calls() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);
        session.handle_text(&auth("T1")).await;
        let calls_after_auth = gateway.calls().len();

        let action = session
            .handle_text(r#"{"type":"control_relay","relay_status":1}"#)
            .await;
        assert_eq!(
            action,
            Action::Reply(Outbound::Command(Command::RelayControl {
                relay_status: RelayState::On
            }))
        );
        assert_eq!(gateway.calls().len(), calls_after_auth);
    }

    #[tokio::test]
    async fn test_control_relay_before_auth() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);

        let action = session
            .handle_text(r#"{"type":"control_relay","relay_status":0}"#)
            .await;
        assert_eq!(action, Action::Reply(Outbound::error(NOT_AUTHENTICATED)));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_state() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);
        session.handle_text(&auth("T1")).await;

        for frame in ["not json", r#"{"type":"reboot"}"#, r#"{"device_token":"T1"}"#] {
            let action = session.handle_text(frame).await;
            assert!(
                matches!(action, Action::Reply(Outbound::Reply(Reply::Error { .. }))),
                "unexpected action for {:?}: {:?}",
                frame,
                action
            );
        }
        assert_eq!(session.device_id(), Some(42));
    }

    #[tokio::test]
    async fn test_invalid_utf8_frame_keeps_session_open() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);

        let action = session
            .handle_frame(b"{\"type\":\"auth\",\"device_token\":\"\xff\xfe\"}")
            .await;
        assert!(matches!(
            action,
            Action::Reply(Outbound::Reply(Reply::Error { ref message })) if message.contains("UTF-8")
        ));
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(gateway.calls().is_empty());

        let action = session.handle_frame(auth("T1").as_bytes()).await;
        assert!(matches!(action, Action::Authorized { device_id: 42, .. }));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let gateway_dyn: Arc<dyn DeviceGateway> = gateway.clone();
        let mut session = Session::new(gateway_dyn, 32);

        let action = session.handle_text(READING).await;
        assert!(matches!(
            action,
            Action::Reply(Outbound::Reply(Reply::Error { .. }))
        ));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_stays_unauthenticated() {
        let gateway = Arc::new(RecordingGateway {
            fail_lookup: true,
            ..RecordingGateway::with_device("T1", 42)
        });
        let mut session = session_with(&gateway);

        let action = session.handle_text(&auth("T1")).await;
        assert_eq!(action, Action::Reply(Outbound::error(AUTH_UNAVAILABLE)));
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_insert_failure_sends_nothing() {
        let gateway = Arc::new(RecordingGateway {
            fail_insert: true,
            ..RecordingGateway::with_device("T1", 42)
        });
        let mut session = session_with(&gateway);
        session.handle_text(&auth("T1")).await;

        assert_eq!(session.handle_text(READING).await, Action::None);
        assert_eq!(session.device_id(), Some(42));
        assert_eq!(gateway.calls().len(), 2);
        assert!(gateway.readings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_ignores_input() {
        let gateway = Arc::new(RecordingGateway::with_device("T1", 42));
        let mut session = session_with(&gateway);
        session.close();

        assert_eq!(session.handle_text(&auth("T1")).await, Action::None);
        assert!(gateway.calls().is_empty());
    }

    #[test]
    fn test_store_error_mapping() {
        let err: GatewayError = fieldlink_store::Error::DeviceNotFound(9).into();
        assert!(matches!(err, GatewayError::DeviceGone(9)));

        let err: GatewayError = fieldlink_store::Error::AccountNotFound(1).into();
        assert!(matches!(err, GatewayError::Store(_)));
    }
}
