//! State shared by the poller and the acquisition state machine.
//!
//! Owned by the scheduler task; nothing here is behind a lock because only that
//! task ever touches it.

use crate::channel::CommandChannel;
use crate::link::{Command, LightPower, StatusCode};
use crate::store::ReadingsStore;
use crate::well::Well;
use tokio::time::Instant;

/// Everything the scheduler knows about the device and the current run.
#[derive(Debug)]
pub struct SchedulerContext {
    /// Token source and in-flight command
    pub channel: CommandChannel,
    /// Status from the latest current snapshot, or `AwaitingUpdate`
    pub status: StatusCode,
    /// Sensor value from the latest current snapshot
    pub sensor: Option<f64>,
    /// Incremented for every accepted snapshot
    pub snapshot_seq: u64,
    /// Well being sampled, if any
    pub active_well: Option<Well>,
    /// Well the stage was last confirmed to be over
    pub parked_well: Option<Well>,
    /// Recorded readings
    pub store: ReadingsStore,
    /// Time origin for readings
    pub epoch: Instant,
}

impl SchedulerContext {
    /// Fresh context with its epoch at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            channel: CommandChannel::new(),
            status: StatusCode::AwaitingUpdate,
            sensor: None,
            snapshot_seq: 0,
            active_well: None,
            parked_well: None,
            store: ReadingsStore::new(),
            epoch: now,
        }
    }

    /// Issue a command. The shared status waits for a reply carrying its token.
    pub fn issue(&mut self, target: Well, light: LightPower) -> Command {
        self.status = StatusCode::AwaitingUpdate;
        self.channel.issue(target, light)
    }

    /// Commit to sampling `well` and make sure its series exists.
    pub fn activate(&mut self, well: Well) {
        self.active_well = Some(well);
        self.store.activate(well);
    }

    /// Seconds since the epoch.
    pub fn elapsed_secs(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.epoch).as_secs_f64()
    }

    /// Clear the store and restart the clock.
    pub fn reset_store(&mut self, now: Instant) {
        self.store.clear();
        self.epoch = now;
    }

    /// Target for a final light-off: the parked well, else wherever the last
    /// command sent the stage. `None` if nothing was ever commanded.
    pub fn light_off_target(&self) -> Option<Well> {
        self.parked_well
            .or_else(|| self.channel.latest().map(|command| command.target))
    }
}
