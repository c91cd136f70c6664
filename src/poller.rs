//! Status/sensor poller.
//!
//! The scheduler asks for a status snapshot every `period`. Each reply is
//! reconciled against the command channel: only a snapshot echoing the latest
//! issued token is published, to the shared context and to the display.
//! Anything older describes a device state that a newer command has already
//! replaced, so it is dropped without touching shared state.

use crate::context::SchedulerContext;
use crate::display::{Calibration, DisplayUpdate, StatusDisplay};
use crate::link::{LinkError, Snapshot, StatusCode};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Result of reconciling one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Published to the context and display.
    Current,
    /// Token did not match the latest command; ignored.
    Stale,
}

/// Reconciles status replies and publishes them.
#[derive(Debug, Clone)]
pub struct Poller {
    period: Duration,
    calibration: Calibration,
}

impl Poller {
    /// Poller with the given cadence and display calibration.
    pub fn new(period: Duration, calibration: Calibration) -> Self {
        Self {
            period,
            calibration,
        }
    }

    /// Interval between status requests.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Apply a snapshot if it answers the latest command.
    pub fn reconcile(
        &self,
        ctx: &mut SchedulerContext,
        snapshot: Snapshot,
        display: &mut dyn StatusDisplay,
    ) -> PollOutcome {
        if !ctx.channel.is_current(snapshot.token) {
            trace!(
                "Ignoring stale status for token {} (latest {:?})",
                snapshot.token,
                ctx.channel.latest_token()
            );
            return PollOutcome::Stale;
        }

        let previous = ctx.status;
        ctx.status = snapshot.status;
        ctx.sensor = snapshot.sensor;
        ctx.snapshot_seq += 1;

        if snapshot.status == StatusCode::Unknown && previous != StatusCode::Unknown {
            warn!("Device reported an unknown status (token {})", snapshot.token);
            display.notice("Device reported an unknown status");
        }

        display.update(&DisplayUpdate::new(
            snapshot.status,
            snapshot.sensor,
            &self.calibration,
        ));
        PollOutcome::Current
    }

    /// Handle the result of one status request. A failed request leaves the
    /// shared status as it was.
    pub fn on_poll_result(
        &self,
        ctx: &mut SchedulerContext,
        result: Result<Snapshot, LinkError>,
        display: &mut dyn StatusDisplay,
    ) -> Option<PollOutcome> {
        match result {
            Ok(snapshot) => Some(self.reconcile(ctx, snapshot, display)),
            Err(e) => {
                debug!("Status poll failed: {}", e);
                None
            }
        }
    }
}
