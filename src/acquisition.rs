//! Acquisition state machine.
//!
//! Drives one run over a [`Tour`], one well at a time:
//!
//! ```text
//!   Idle ──pop──► Seeking(w) ──ready──► Arrived(w) ──light on──► Sampling(w)
//!    ▲  └──head is parked well──────────────┘                        │
//!    └──────────────────────── light off ◄── samples taken ──────────┘
//!   Idle with an empty tour ──light off──► Done
//! ```
//!
//! The machine never talks to the device itself. Each [`Acquisition::tick`]
//! reads the shared [`SchedulerContext`] (status and sensor published by the
//! poller) and returns the commands it issued for the scheduler to dispatch.
//! A tick makes at most one transition, and a status that is not ready leaves
//! the machine where it is.
//!
//! There is no position feedback from the controller: arrival is inferred from
//! a `ready` status on a reply to the move command.

use crate::context::SchedulerContext;
use crate::link::{Command, LightPower, StatusCode};
use crate::store::Reading;
use crate::tour::Tour;
use crate::well::Well;
use tokio::time::Instant;
use tracing::{debug, info};

/// How many samples to take per well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPolicy {
    /// Samples discarded after the lamp comes on
    pub settle_samples: u32,
    /// Samples recorded after settling, at least one
    pub recorded_samples: u32,
}

impl SamplingPolicy {
    /// Samples taken per well.
    pub fn total(&self) -> u32 {
        self.settle_samples + self.recorded_samples
    }
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            settle_samples: 1,
            recorded_samples: 1,
        }
    }
}

/// Where the run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Between wells
    Idle,
    /// Move issued, waiting for the stage to report ready
    Seeking(Well),
    /// Stage is over the well, lamp not yet on
    Arrived(Well),
    /// Lamp on, counting down samples
    Sampling {
        /// Well being sampled
        well: Well,
        /// Samples still to take
        remaining: u32,
        /// Snapshot sequence already looked at
        last_seen: u64,
    },
    /// Run finished or stopped
    Done,
}

/// One acquisition run.
#[derive(Debug)]
pub struct Acquisition {
    planned: Vec<Well>,
    tour: Tour,
    policy: SamplingPolicy,
    state: AcquisitionState,
    completed: Vec<Well>,
    stopped: bool,
}

impl Acquisition {
    /// Run that will visit `tour` in order.
    ///
    /// At least one sample is recorded per well, whatever `policy` asks for.
    pub fn new(tour: Tour, policy: SamplingPolicy) -> Self {
        Self {
            planned: tour.to_vec(),
            tour,
            policy: SamplingPolicy {
                recorded_samples: policy.recorded_samples.max(1),
                ..policy
            },
            state: AcquisitionState::Idle,
            completed: Vec::new(),
            stopped: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// True once the run reached `Done`.
    pub fn is_done(&self) -> bool {
        self.state == AcquisitionState::Done
    }

    /// Wells in the order the run was planned to visit them.
    pub fn planned(&self) -> &[Well] {
        &self.planned
    }

    /// Wells whose sampling finished, in visiting order.
    pub fn completed(&self) -> &[Well] {
        &self.completed
    }

    /// Wells not yet started.
    pub fn remaining(&self) -> &Tour {
        &self.tour
    }

    /// True if the run ended through [`Acquisition::stop`].
    pub fn was_stopped(&self) -> bool {
        self.stopped
    }

    /// Advance the run by at most one transition.
    pub fn tick(&mut self, ctx: &mut SchedulerContext, now: Instant) -> Vec<Command> {
        let mut issued = Vec::new();

        match self.state {
            AcquisitionState::Idle => match self.tour.pop() {
                None => {
                    if let Some(target) = ctx.light_off_target() {
                        issued.push(ctx.issue(target, LightPower::Off));
                    }
                    info!("Acquisition complete: {} wells sampled", self.completed.len());
                    self.state = AcquisitionState::Done;
                }
                Some(well) if ctx.parked_well == Some(well) => {
                    debug!("Already parked over {}", well);
                    ctx.activate(well);
                    self.state = AcquisitionState::Arrived(well);
                }
                Some(well) => {
                    debug!("Seeking {}", well);
                    ctx.activate(well);
                    ctx.parked_well = None;
                    issued.push(ctx.issue(well, LightPower::Off));
                    self.state = AcquisitionState::Seeking(well);
                }
            },

            AcquisitionState::Seeking(well) => {
                if ctx.status == StatusCode::Ready && ctx.active_well == Some(well) {
                    debug!("Arrived at {}", well);
                    ctx.parked_well = Some(well);
                    self.state = AcquisitionState::Arrived(well);
                }
            }

            AcquisitionState::Arrived(well) => {
                issued.push(ctx.issue(well, LightPower::On));
                self.state = AcquisitionState::Sampling {
                    well,
                    remaining: self.policy.total(),
                    last_seen: ctx.snapshot_seq,
                };
            }

            AcquisitionState::Sampling {
                well,
                mut remaining,
                mut last_seen,
            } => {
                if ctx.snapshot_seq != last_seen {
                    last_seen = ctx.snapshot_seq;
                    let lit = matches!(ctx.status, StatusCode::Ready | StatusCode::Reading);
                    if let (true, Some(value)) = (lit, ctx.sensor) {
                        let taken = self.policy.total() - remaining;
                        remaining = remaining.saturating_sub(1);
                        if taken >= self.policy.settle_samples {
                            let reading = Reading::new(ctx.elapsed_secs(now), value);
                            debug!("{} t={}s value={}", well, reading.time, reading.value);
                            ctx.store.append(well, reading);
                        }
                    }
                }

                if remaining == 0 {
                    issued.push(ctx.issue(well, LightPower::Off));
                    ctx.active_well = None;
                    self.completed.push(well);
                    info!("Finished {} ({} remaining)", well, self.tour.len());
                    self.state = AcquisitionState::Idle;
                } else {
                    self.state = AcquisitionState::Sampling {
                        well,
                        remaining,
                        last_seen,
                    };
                }
            }

            AcquisitionState::Done => {}
        }

        issued
    }

    /// Cancel the run: drop the rest of the tour and turn the lamp off.
    ///
    /// Returns the light-off command, or `None` if the run was already done or
    /// nothing was ever commanded.
    pub fn stop(&mut self, ctx: &mut SchedulerContext) -> Option<Command> {
        if self.is_done() {
            return None;
        }
        info!(
            "Stopping acquisition with {} wells left",
            self.tour.len() + usize::from(self.state != AcquisitionState::Idle)
        );
        self.tour.clear();
        self.stopped = true;
        self.state = AcquisitionState::Done;
        ctx.active_well = None;
        ctx.light_off_target()
            .map(|target| ctx.issue(target, LightPower::Off))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(250);

    fn well(name: &str) -> Well {
        name.parse().unwrap()
    }

    fn tour(names: &[&str]) -> Tour {
        Tour::from_wells(names.iter().map(|n| well(n)))
    }

    /// A current snapshot arriving from the poller.
    fn reply(ctx: &mut SchedulerContext, status: StatusCode, sensor: Option<f64>) {
        ctx.status = status;
        ctx.sensor = sensor;
        ctx.snapshot_seq += 1;
    }

    #[test]
    fn test_three_wells_one_reading_each() {
        let start = Instant::now();
        let mut ctx = SchedulerContext::new(start);
        let mut run = Acquisition::new(tour(&["A1", "A2", "B1"]), SamplingPolicy::default());
        let mut now = start;
        let mut commands = Vec::new();

        for _ in 0..100 {
            if run.is_done() {
                break;
            }
            now += TICK;
            let issued = run.tick(&mut ctx, now);
            commands.extend(issued);
            // Responsive device: ready with a value after every tick
            reply(&mut ctx, StatusCode::Ready, Some(500.0));
        }

        assert!(run.is_done());
        assert!(!run.was_stopped());
        assert_eq!(run.completed(), &[well("A1"), well("A2"), well("B1")]);
        for name in ["A1", "A2", "B1"] {
            assert_eq!(ctx.store.series(&well(name)).map(<[Reading]>::len), Some(1));
        }
        assert_eq!(ctx.active_well, None);
        assert_eq!(ctx.parked_well, Some(well("B1")));

        let last = commands.last().unwrap();
        assert_eq!(last.light, LightPower::Off);
        assert_eq!(last.target, well("B1"));
        assert!(commands.windows(2).all(|w| w[1].token > w[0].token));
    }

    #[test]
    fn test_walkthrough_of_one_well() {
        let start = Instant::now();
        let mut ctx = SchedulerContext::new(start);
        let mut run = Acquisition::new(tour(&["C5"]), SamplingPolicy::default());

        let moved = run.tick(&mut ctx, start);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].light, LightPower::Off);
        assert_eq!(run.state(), AcquisitionState::Seeking(well("C5")));
        assert_eq!(ctx.active_well, Some(well("C5")));
        assert_eq!(ctx.store.all_wells(), &[well("C5")]);

        reply(&mut ctx, StatusCode::Ready, Some(12.0));
        assert!(run.tick(&mut ctx, start).is_empty());
        assert_eq!(run.state(), AcquisitionState::Arrived(well("C5")));
        assert_eq!(ctx.parked_well, Some(well("C5")));

        let lit = run.tick(&mut ctx, start);
        assert_eq!(lit[0].light, LightPower::On);
        assert!(matches!(
            run.state(),
            AcquisitionState::Sampling { remaining: 2, .. }
        ));

        // Settle sample is discarded
        reply(&mut ctx, StatusCode::Ready, Some(2600.0));
        assert!(run.tick(&mut ctx, start + Duration::from_millis(500)).is_empty());
        assert_eq!(ctx.store.series(&well("C5")).map(<[Reading]>::len), Some(0));

        reply(&mut ctx, StatusCode::Ready, Some(2610.0));
        let off = run.tick(&mut ctx, start + Duration::from_millis(1500));
        assert_eq!(off[0].light, LightPower::Off);
        assert_eq!(run.state(), AcquisitionState::Idle);
        assert_eq!(
            ctx.store.series(&well("C5")),
            Some(&[Reading::new(1.5, 2610.0)][..])
        );
    }

    #[test]
    fn test_waits_while_not_ready() {
        let mut ctx = SchedulerContext::new(Instant::now());
        let mut run = Acquisition::new(tour(&["B2"]), SamplingPolicy::default());
        run.tick(&mut ctx, Instant::now());

        for status in [
            StatusCode::AwaitingUpdate,
            StatusCode::Moving,
            StatusCode::Homing,
            StatusCode::Initializing,
            StatusCode::Unknown,
        ] {
            reply(&mut ctx, status, Some(12.0));
            assert!(run.tick(&mut ctx, Instant::now()).is_empty());
            assert_eq!(run.state(), AcquisitionState::Seeking(well("B2")));
        }
        assert_eq!(ctx.parked_well, None);
    }

    #[test]
    fn test_parked_well_short_circuits_move() {
        let mut ctx = SchedulerContext::new(Instant::now());
        ctx.parked_well = Some(well("D4"));
        let mut run = Acquisition::new(tour(&["D4", "D5"]), SamplingPolicy::default());

        assert!(run.tick(&mut ctx, Instant::now()).is_empty());
        assert_eq!(run.state(), AcquisitionState::Arrived(well("D4")));
        assert_eq!(ctx.active_well, Some(well("D4")));

        let lit = run.tick(&mut ctx, Instant::now());
        assert_eq!(lit.len(), 1);
        assert_eq!(lit[0].target, well("D4"));
        assert_eq!(lit[0].light, LightPower::On);
    }

    #[test]
    fn test_reading_status_counts_as_sample() {
        let mut ctx = SchedulerContext::new(Instant::now());
        ctx.parked_well = Some(well("A1"));
        let policy = SamplingPolicy {
            settle_samples: 0,
            recorded_samples: 1,
        };
        let mut run = Acquisition::new(tour(&["A1"]), policy);
        run.tick(&mut ctx, Instant::now());
        run.tick(&mut ctx, Instant::now());

        reply(&mut ctx, StatusCode::Reading, Some(2700.0));
        let off = run.tick(&mut ctx, Instant::now());
        assert_eq!(off.len(), 1);
        assert_eq!(run.completed(), &[well("A1")]);
    }

    #[test]
    fn test_zero_sample_policy_still_records_one() {
        let mut ctx = SchedulerContext::new(Instant::now());
        ctx.parked_well = Some(well("A1"));
        let policy = SamplingPolicy {
            settle_samples: 0,
            recorded_samples: 0,
        };
        let mut run = Acquisition::new(tour(&["A1"]), policy);
        run.tick(&mut ctx, Instant::now());
        run.tick(&mut ctx, Instant::now());
        assert!(matches!(
            run.state(),
            AcquisitionState::Sampling { remaining: 1, .. }
        ));

        reply(&mut ctx, StatusCode::Ready, Some(2700.0));
        let off = run.tick(&mut ctx, Instant::now());
        assert_eq!(off.len(), 1);
        assert_eq!(run.completed(), &[well("A1")]);
        assert_eq!(ctx.store.series(&well("A1")).map(<[Reading]>::len), Some(1));
    }

    #[test]
    fn test_sample_needs_new_snapshot_with_value() {
        let mut ctx = SchedulerContext::new(Instant::now());
        ctx.parked_well = Some(well("A1"));
        let policy = SamplingPolicy {
            settle_samples: 0,
            recorded_samples: 2,
        };
        let mut run = Acquisition::new(tour(&["A1"]), policy);
        run.tick(&mut ctx, Instant::now());
        run.tick(&mut ctx, Instant::now());

        // No value yet
        reply(&mut ctx, StatusCode::Ready, None);
        run.tick(&mut ctx, Instant::now());
        reply(&mut ctx, StatusCode::Ready, Some(2700.0));
        run.tick(&mut ctx, Instant::now());
        // Same snapshot seen again is not a new sample
        run.tick(&mut ctx, Instant::now());

        assert!(matches!(
            run.state(),
            AcquisitionState::Sampling { remaining: 1, .. }
        ));
        assert_eq!(ctx.store.series(&well("A1")).map(<[Reading]>::len), Some(1));
    }

    #[test]
    fn test_stop_turns_light_off_once() {
        let mut ctx = SchedulerContext::new(Instant::now());
        let mut run = Acquisition::new(tour(&["A1", "H12"]), SamplingPolicy::default());
        let moved = run.tick(&mut ctx, Instant::now());

        let off = run.stop(&mut ctx).unwrap();
        assert_eq!(off.light, LightPower::Off);
        assert_eq!(off.target, moved[0].target);
        assert!(off.token > moved[0].token);
        assert!(run.is_done());
        assert!(run.was_stopped());
        assert!(run.remaining().is_empty());
        assert_eq!(ctx.active_well, None);

        assert_eq!(run.stop(&mut ctx), None);
        assert!(run.tick(&mut ctx, Instant::now()).is_empty());
    }

    #[test]
    fn test_empty_tour_without_history_sends_nothing() {
        let mut ctx = SchedulerContext::new(Instant::now());
        let mut run = Acquisition::new(Tour::default(), SamplingPolicy::default());
        assert!(run.tick(&mut ctx, Instant::now()).is_empty());
        assert!(run.is_done());
        assert_eq!(ctx.channel.latest_token(), None);
    }
}
