//! Mock Device Link
//!
//! Simulated plate reader controller for tests and dry runs without hardware.
//! All delays use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Behaviour
//!
//! - A move to a different well reports `moving` for a configurable number of
//!   polls, then `ready` at the new position.
//! - A command for the current position is `ready` immediately.
//! - The sensor reads a per-well value while the lamp is on and a dark value
//!   while it is off.
//! - Failures can be injected: transport failures (retried by the scheduler),
//!   rejections, and stale replies carrying the previous token.
//!
//! Every request goes through the wire codec, so the simulated controller sees
//! exactly the bytes a real one would.

use super::{Command, DeviceLink, LightPower, LinkError, Snapshot, StatusCode, Token};
use crate::well::Well;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::debug;

/// Sensor value reported while the lamp is off.
pub const DARK_READING: f64 = 12.0;

#[derive(Debug)]
struct MockDevice {
    accepted_token: Token,
    status: StatusCode,
    light: LightPower,
    position: Option<Well>,
    target: Option<Well>,
    moving_polls_left: u32,
    move_polls: u32,
    lit_status: StatusCode,
    fail_commands: u32,
    fail_token: Option<(Token, u32)>,
    reject_commands: u32,
    stale_polls: u32,
    received: Vec<Command>,
    polls: u64,
}

impl MockDevice {
    fn settled_status(&self) -> StatusCode {
        match self.light {
            LightPower::On => self.lit_status,
            LightPower::Off => StatusCode::Ready,
        }
    }

    fn sensor(&self) -> Option<f64> {
        match (self.light, self.position) {
            (LightPower::On, Some(well)) if self.status != StatusCode::Moving => {
                Some(MockLink::sensor_value_for(&well))
            }
            _ => Some(DARK_READING),
        }
    }
}

/// Simulated plate reader.
///
/// Clones share the same simulated device, so a test can keep a handle while
/// the scheduler owns another.
#[derive(Clone, Debug)]
pub struct MockLink {
    device: Arc<RwLock<MockDevice>>,
    latency: Duration,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Device that reaches every well on the first poll after a move.
    pub fn new() -> Self {
        Self::with_move_polls(0)
    }

    /// Device that reports `moving` for `move_polls` polls after each move.
    pub fn with_move_polls(move_polls: u32) -> Self {
        Self {
            device: Arc::new(RwLock::new(MockDevice {
                accepted_token: 0,
                status: StatusCode::Ready,
                light: LightPower::Off,
                position: None,
                target: None,
                moving_polls_left: 0,
                move_polls,
                lit_status: StatusCode::Ready,
                fail_commands: 0,
                fail_token: None,
                reject_commands: 0,
                stale_polls: 0,
                received: Vec::new(),
                polls: 0,
            })),
            latency: Duration::ZERO,
        }
    }

    /// Delay every request by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report `reading` instead of `ready` while the lamp is lit, as the
    /// firmware does.
    pub async fn report_reading_while_lit(&self) {
        self.device.write().await.lit_status = StatusCode::Reading;
    }

    /// Fail the next `count` commands with a server failure.
    pub async fn fail_next_commands(&self, count: u32) {
        self.device.write().await.fail_commands = count;
    }

    /// Fail the first `count` deliveries of the command carrying `token`.
    pub async fn fail_token(&self, token: Token, count: u32) {
        self.device.write().await.fail_token = Some((token, count));
    }

    /// Reject the next `count` commands.
    pub async fn reject_next_commands(&self, count: u32) {
        self.device.write().await.reject_commands = count;
    }

    /// Answer the next `count` polls with the previous command's token.
    pub async fn stale_next_polls(&self, count: u32) {
        self.device.write().await.stale_polls = count;
    }

    /// Every command the device received, including failed deliveries.
    pub async fn received_commands(&self) -> Vec<Command> {
        self.device.read().await.received.clone()
    }

    /// Number of status polls answered.
    pub async fn poll_count(&self) -> u64 {
        self.device.read().await.polls
    }

    /// Current stage position.
    pub async fn position(&self) -> Option<Well> {
        self.device.read().await.position
    }

    /// Current lamp state.
    pub async fn light(&self) -> LightPower {
        self.device.read().await.light
    }

    /// Deterministic lit reading for a well.
    pub fn sensor_value_for(well: &Well) -> f64 {
        let optical_density = 0.1 * f64::from(well.row()) + 0.01 * f64::from(well.col());
        (2836.0 - 378.0 * optical_density).round()
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send_command(&self, command: &Command) -> Result<(), LinkError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let mut device = self.device.write().await;
        device.received.push(*command);

        if device.fail_commands > 0 {
            device.fail_commands -= 1;
            debug!("MockLink: dropping command {}", command);
            return Err(LinkError::ServerFailure("simulated 503".to_string()));
        }
        if let Some((token, left)) = device.fail_token.as_mut() {
            if *token == command.token && *left > 0 {
                *left -= 1;
                debug!("MockLink: dropping command {}", command);
                return Err(LinkError::ServerFailure("simulated 503".to_string()));
            }
        }
        if device.reject_commands > 0 {
            device.reject_commands -= 1;
            return Err(LinkError::Rejected("simulated 400".to_string()));
        }

        let decoded = Command::parse_wire(&command.to_wire())?;
        device.accepted_token = decoded.token;
        device.light = decoded.light;
        device.target = Some(decoded.target);

        if device.position == Some(decoded.target) || device.move_polls == 0 {
            device.position = Some(decoded.target);
            device.moving_polls_left = 0;
            device.status = device.settled_status();
        } else {
            device.position = None;
            device.moving_polls_left = device.move_polls;
            device.status = StatusCode::Moving;
        }

        debug!("MockLink: accepted {}", decoded);
        Ok(())
    }

    async fn poll_status(&self) -> Result<Snapshot, LinkError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let mut device = self.device.write().await;
        device.polls += 1;

        if device.status == StatusCode::Moving {
            if device.moving_polls_left == 0 {
                device.position = device.target;
                device.status = device.settled_status();
            } else {
                device.moving_polls_left -= 1;
            }
        }

        let token = if device.stale_polls > 0 {
            device.stale_polls -= 1;
            device.accepted_token.saturating_sub(1)
        } else {
            device.accepted_token
        };

        let snapshot = Snapshot {
            token,
            status: device.status,
            sensor: device.sensor(),
        };
        Snapshot::parse_wire(&snapshot.to_wire())
    }
}
