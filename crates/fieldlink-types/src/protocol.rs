//! Device wire protocol.
//!
//! Devices exchange small JSON objects with the service, one object per
//! WebSocket text frame or one per line on the raw TCP transport. Inbound
//! objects are discriminated by their `type` field; replies carry a `status`
//! field, and commands pushed to a device carry a `type` field.

use core::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ProtocolError, ProtocolResult};

/// Database identity of a registered device.
pub type DeviceId = i64;

/// Desired or reported state of a device's relay channel.
///
/// Encoded on the wire as the integers `0` and `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RelayState {
    Off,
    On,
}

impl TryFrom<u8> for RelayState {
    type Error = RelayStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RelayState::Off),
            1 => Ok(RelayState::On),
            other => Err(RelayStateError(other)),
        }
    }
}

impl From<RelayState> for u8 {
    fn from(state: RelayState) -> Self {
        match state {
            RelayState::Off => 0,
            RelayState::On => 1,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Off => write!(f, "off"),
            RelayState::On => write!(f, "on"),
        }
    }
}

/// Rejected relay value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStateError(pub u8);

impl fmt::Display for RelayStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay_status must be 0 or 1, got {}", self.0)
    }
}

impl std::error::Error for RelayStateError {}

/// One sensor sample as reported by a device.
///
/// The server stamps the sample with its own receive time when it is stored;
/// devices do not send a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Air temperature in degrees Celsius.
    pub temperature: f64,
    /// Relative humidity percentage.
    pub humidity: f64,
    /// Ambient light level (raw sensor units).
    pub light_level: f64,
    /// Soil moisture (raw sensor units or percentage, device dependent).
    pub soil_moisture: f64,
    /// CO2 concentration in ppm.
    pub co2_ppm: f64,
    /// Analog reading of the rain sensor.
    pub rain_analog: f64,
    /// Relay state at the time of the sample.
    pub relay_status: RelayState,
}

impl SensorSample {
    /// Check that every numeric field is finite.
    pub fn validate(&self) -> ProtocolResult<()> {
        let fields = [
            ("temperature", self.temperature),
            ("humidity", self.humidity),
            ("light_level", self.light_level),
            ("soil_moisture", self.soil_moisture),
            ("co2_ppm", self.co2_ppm),
            ("rain_analog", self.rain_analog),
        ];

        for (field, value) in fields {
            if !value.is_finite() {
                return Err(ProtocolError::InvalidValue {
                    field,
                    reason: format!("{} is not a finite number", value),
                });
            }
        }

        Ok(())
    }
}

/// A message sent by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Present the device's pre-shared token.
    Auth { device_token: String },
    /// Stream one sensor sample.
    SensorReading(SensorSample),
    /// Ask for the relay to be switched.
    ControlRelay { relay_status: RelayState },
}

impl Inbound {
    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Auth { .. } => "auth",
            Inbound::SensorReading(_) => "sensor_reading",
            Inbound::ControlRelay { .. } => "control_relay",
        }
    }

    /// Decode and validate one frame.
    ///
    /// Frames longer than `limit` bytes are rejected before parsing.
    ///
    /// # Examples
    ///
    /// ```
    /// use fieldlink_types::{Inbound, RelayState};
    ///
    /// let msg = Inbound::parse(r#"{"type":"control_relay","relay_status":1}"#, 1024).unwrap();
    /// assert_eq!(msg, Inbound::ControlRelay { relay_status: RelayState::On });
    ///
    /// assert!(Inbound::parse(r#"{"type":"reboot"}"#, 1024).is_err());
    /// ```
    pub fn parse(text: &str, limit: usize) -> ProtocolResult<Self> {
        if text.len() > limit {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                limit,
            });
        }

        let message: Inbound = serde_json::from_str(text.trim())?;
        if let Inbound::SensorReading(sample) = &message {
            sample.validate()?;
        }
        Ok(message)
    }

    /// Decode a raw frame, rejecting bytes that are not UTF-8.
    ///
    /// Used by byte-oriented transports such as newline-delimited TCP.
    pub fn decode(frame: &[u8], limit: usize) -> ProtocolResult<Self> {
        if frame.len() > limit {
            return Err(ProtocolError::TooLarge {
                size: frame.len(),
                limit,
            });
        }
        let text = std::str::from_utf8(frame)?;
        Self::parse(text, limit)
    }
}

/// A reply to an inbound message, discriminated by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Reply {
    /// The token matched a registered device.
    Authorized {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    /// The token did not match; the connection closes after this frame.
    Unauthorized,
    /// A sensor sample was stored.
    DataReceived {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    /// The inbound message could not be handled.
    #[serde(rename = "error")]
    Error { message: String },
}

/// A command pushed to a device, discriminated by `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Switch the relay channel.
    RelayControl { relay_status: RelayState },
}

/// Any frame the service writes to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    Reply(Reply),
    Command(Command),
}

impl Outbound {
    /// Shorthand for an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Reply(Reply::Error {
            message: message.into(),
        })
    }

    /// Shorthand for a relay command.
    pub fn relay(relay_status: RelayState) -> Self {
        Outbound::Command(Command::RelayControl { relay_status })
    }

    /// Encode as a single-line JSON string.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Reply> for Outbound {
    fn from(reply: Reply) -> Self {
        Outbound::Reply(reply)
    }
}

impl From<Command> for Outbound {
    fn from(command: Command) -> Self {
        Outbound::Command(command)
    }
}
