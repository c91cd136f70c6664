//! Device link: the remote stage/lamp/sensor controller.
//!
//! The link carries two requests:
//!
//! - **command**: `<token>;<row>,<col>;<lightPower>`: move to a well and set the lamp
//! - **status poll**: reply `<token>;<statusCode>;<sensorValue>`
//!
//! A command describes the complete desired device state (position and lamp), so
//! a newer command fully supersedes an older one. The token echoed in a status
//! reply is the last command token the controller accepted, which is how replies
//! are matched to commands.
//!
//! Implementations:
//! - [`SerialLink`]: line protocol over a serial port
//! - [`MockLink`]: simulated plate reader

pub mod mock;
pub mod serial;

pub use mock::MockLink;
pub use serial::SerialLink;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{LinkKind, LinkSettings};
use crate::well::Well;

/// Correlates a command with the status replies that follow it.
pub type Token = u64;

/// Device link failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Transport or controller-side failure (5xx-equivalent). Safe to retry.
    #[error("Server failure: {0}")]
    ServerFailure(String),

    /// Controller refused the request (4xx-equivalent). Not retried.
    #[error("Rejected by controller: {0}")]
    Rejected(String),

    /// Reply could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The link has not been opened.
    #[error("Device link not connected")]
    NotConnected,

    /// The link needs a cargo feature this build does not have.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureDisabled(String),
}

impl LinkError {
    /// True for failures that the command channel retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::ServerFailure(_))
    }
}

/// Lamp state requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightPower {
    /// Lamp off (`0` on the wire)
    Off,
    /// Lamp on (`1` on the wire)
    On,
}

impl LightPower {
    /// Wire value.
    pub fn as_wire(self) -> u8 {
        match self {
            LightPower::Off => 0,
            LightPower::On => 1,
        }
    }

    /// Decode a wire value.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(LightPower::Off),
            1 => Some(LightPower::On),
            _ => None,
        }
    }
}

/// One outbound command. Retries resend this exact value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    /// Unique, monotonically increasing
    pub token: Token,
    /// Stage position
    pub target: Well,
    /// Lamp state
    pub light: LightPower,
}

impl Command {
    /// Encode as `<token>;<row>,<col>;<lightPower>`.
    pub fn to_wire(&self) -> String {
        format!(
            "{};{},{};{}",
            self.token,
            self.target.row(),
            self.target.col(),
            self.light.as_wire()
        )
    }

    /// Decode a command body.
    pub fn parse_wire(body: &str) -> Result<Self, LinkError> {
        let malformed = || LinkError::Protocol(format!("Malformed command: '{}'", body));
        let mut fields = body.trim().split(';');
        let token = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(malformed)?;
        let (row, col) = fields
            .next()
            .and_then(|f| f.split_once(','))
            .ok_or_else(malformed)?;
        let row: u8 = row.parse().map_err(|_| malformed())?;
        let col: u8 = col.parse().map_err(|_| malformed())?;
        let light = fields
            .next()
            .and_then(|f| f.parse().ok())
            .and_then(LightPower::from_wire)
            .ok_or_else(malformed)?;
        if fields.next().is_some() {
            return Err(malformed());
        }
        let target = Well::new(row, col).map_err(|_| malformed())?;
        Ok(Self {
            token,
            target,
            light,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let light = match self.light {
            LightPower::Off => "off",
            LightPower::On => "on",
        };
        write!(f, "#{} {} light {}", self.token, self.target, light)
    }
}

/// Device status codes, shared by the wire protocol and the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// No reply matching the latest command yet (`-1`)
    AwaitingUpdate,
    /// Controller booting (`0`)
    Initializing,
    /// Idle at the commanded position (`1`)
    Ready,
    /// Homing the stage (`2`)
    Homing,
    /// Moving to position (`3`)
    Moving,
    /// Lamp on, reading absorbance (`4`)
    Reading,
    /// Anything else the controller reports (`5`)
    Unknown,
}

impl StatusCode {
    /// Wire value.
    pub fn code(self) -> i32 {
        match self {
            StatusCode::AwaitingUpdate => -1,
            StatusCode::Initializing => 0,
            StatusCode::Ready => 1,
            StatusCode::Homing => 2,
            StatusCode::Moving => 3,
            StatusCode::Reading => 4,
            StatusCode::Unknown => 5,
        }
    }

    /// Decode a wire value; unrecognised codes map to `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => StatusCode::AwaitingUpdate,
            0 => StatusCode::Initializing,
            1 => StatusCode::Ready,
            2 => StatusCode::Homing,
            3 => StatusCode::Moving,
            4 => StatusCode::Reading,
            _ => StatusCode::Unknown,
        }
    }
}

/// One polled `(token, status, sensor)` triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    /// Token of the last command the controller accepted
    pub token: Token,
    /// Device status
    pub status: StatusCode,
    /// Latest sensor value, if the controller has one
    pub sensor: Option<f64>,
}

impl Snapshot {
    /// Encode as `<token>;<statusCode>;<sensorValue>`. An absent value is an empty field.
    pub fn to_wire(&self) -> String {
        let sensor = self.sensor.map(|v| v.to_string()).unwrap_or_default();
        format!("{};{};{}", self.token, self.status.code(), sensor)
    }

    /// Decode a status body.
    ///
    /// An empty or negative sensor field means the controller has no reading yet
    /// (the firmware reports `-1` before its first sample).
    pub fn parse_wire(body: &str) -> Result<Self, LinkError> {
        let malformed = || LinkError::Protocol(format!("Malformed status: '{}'", body));
        let mut fields = body.trim().split(';');
        let token = fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(malformed)?;
        let status = fields
            .next()
            .and_then(|f| f.trim().parse::<i32>().ok())
            .map(StatusCode::from_code)
            .ok_or_else(malformed)?;
        let sensor = match fields.next().map(str::trim) {
            None | Some("") => None,
            Some(field) => {
                let value: f64 = field.parse().map_err(|_| malformed())?;
                (value >= 0.0).then_some(value)
            }
        };
        if fields.next().is_some() {
            return Err(malformed());
        }
        Ok(Self {
            token,
            status,
            sensor,
        })
    }
}

/// Remote controller for the stage, lamp and sensor.
///
/// Methods take `&self` so a link can be shared with the background tasks the
/// scheduler spawns for each request.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Deliver a command. `Ok` means the controller accepted it.
    async fn send_command(&self, command: &Command) -> Result<(), LinkError>;

    /// Request the current status snapshot.
    async fn poll_status(&self) -> Result<Snapshot, LinkError>;
}

/// Build the link selected in `settings`, opening the serial port if needed.
///
/// # Errors
/// Port open failures, or `FeatureDisabled` for a serial link in a build
/// without `instrument_serial`.
pub fn open(settings: &LinkSettings) -> Result<Arc<dyn DeviceLink>, LinkError> {
    match settings.kind {
        LinkKind::Mock => {
            info!("Using simulated plate reader");
            Ok(Arc::new(MockLink::with_move_polls(settings.mock_move_polls)))
        }
        LinkKind::Serial => {
            let mut link =
                SerialLink::new(settings.port.as_str(), settings.baud_rate).with_timeout(settings.timeout);
            link.connect()?;
            info!("Connected to plate reader on {}", settings.port);
            Ok(Arc::new(link))
        }
    }
}
