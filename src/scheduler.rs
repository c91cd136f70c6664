//! Actor-based acquisition scheduler
//!
//! A single task owns the [`SchedulerContext`] and serializes everything that
//! touches it through one `select!` loop:
//!
//! - handle commands ([`SchedulerCommand`])
//! - the poll timer, which asks the device for a status snapshot
//! - the tick timer, which advances the active [`Acquisition`]
//! - link events: results of send/poll requests running in spawned tasks, and
//!   retry timers
//!
//! Device requests never block the loop. Each one runs in its own task and
//! reports back over an unbounded channel, so a slow or silent controller only
//! delays the step that waits on it.
//!
//! At most one command send is outstanding. A command issued meanwhile waits
//! in a single slot, where a newer one replaces it, so commands reach the
//! controller in token order. A failed send is retried only if its token is
//! still the latest when the retry delay elapses.

use crate::acquisition::Acquisition;
use crate::channel::DispatchOutcome;
use crate::config::Settings;
use crate::context::SchedulerContext;
use crate::display::{status_text, StatusDisplay};
use crate::error::{AppResult, ReaderError};
use crate::link::{Command, DeviceLink, LightPower, LinkError, Snapshot, Token};
use crate::messages::{RunSummary, SchedulerCommand, StatusReport};
use crate::poller::Poller;
use crate::recovery::deliver_with_retry;
use crate::store::ReadingsStore;
use crate::tour;
use crate::well::{PlateGrid, Well};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of the handle command queue.
const COMMAND_QUEUE: usize = 32;

/// Result of a request running outside the scheduler task.
#[derive(Debug)]
enum LinkEvent {
    Dispatched {
        command: Command,
        result: Result<(), LinkError>,
    },
    RetryDue(Command),
    Status(Result<Snapshot, LinkError>),
}

struct ActiveRun {
    acquisition: Acquisition,
    retries_at_start: u64,
    responder: Option<oneshot::Sender<AppResult<RunSummary>>>,
}

/// Owns the device link, the display and all scheduler state.
pub struct Scheduler {
    settings: Settings,
    grid: PlateGrid,
    link: Arc<dyn DeviceLink>,
    display: Box<dyn StatusDisplay>,
    poller: Poller,
    ctx: SchedulerContext,
    run: Option<ActiveRun>,
    poll_in_flight: bool,
    send_in_flight: bool,
    queued: Option<Command>,
    last_delivered: Option<Token>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl Scheduler {
    /// Creates a scheduler; nothing runs until [`Scheduler::spawn`].
    pub fn new(
        settings: Settings,
        link: Arc<dyn DeviceLink>,
        display: Box<dyn StatusDisplay>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            grid: settings.grid(),
            poller: Poller::new(settings.acquisition.poll_interval, settings.calibration()),
            settings,
            link,
            display,
            ctx: SchedulerContext::new(Instant::now()),
            run: None,
            poll_in_flight: false,
            send_in_flight: false,
            queued: None,
            last_delivered: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Start the scheduler task on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(self.run(rx));
        SchedulerHandle { tx }
    }

    /// Runs the scheduler event loop until shutdown or until every handle is dropped
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
        let Some(mut events_rx) = self.events_rx.take() else {
            warn!("Scheduler event loop already ran");
            return;
        };

        let mut poll_timer = interval(self.poller.period());
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_timer = interval(self.settings.acquisition.tick_interval);
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.ctx.epoch = Instant::now();
        info!(
            "Scheduler started on '{}' link ({}x{} plate)",
            self.link.name(),
            self.grid.rows(),
            self.grid.cols()
        );

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(response) = self.handle_command(command) {
                            info!("Shutdown command received");
                            self.shutdown(&mut events_rx).await;
                            let _ = response.send(());
                            break;
                        }
                    }
                    None => {
                        debug!("All scheduler handles dropped");
                        self.shutdown(&mut events_rx).await;
                        break;
                    }
                },

                _ = poll_timer.tick() => self.request_status(),

                _ = tick_timer.tick() => self.on_tick(),

                Some(event) = events_rx.recv() => self.on_link_event(event),
            }
        }

        info!("Scheduler shutting down");
    }

    /// Apply `command`; breaks with the responder once shutdown is requested.
    fn handle_command(&mut self, command: SchedulerCommand) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            SchedulerCommand::ReadSelected { wells, response } => {
                self.start_run(wells, response);
            }

            SchedulerCommand::Stop { response } => {
                let stopped = self.stop_run();
                let _ = response.send(stopped);
            }

            SchedulerCommand::Reset { response } => {
                let result = if self.run.is_some() {
                    Err(ReaderError::RunInProgress)
                } else {
                    self.ctx.reset_store(Instant::now());
                    info!("Readings cleared");
                    Ok(())
                };
                let _ = response.send(result);
            }

            SchedulerCommand::Export { response } => {
                let _ = response.send(self.ctx.store.export());
            }

            SchedulerCommand::SaveCsv { path, response } => {
                let _ = response.send(self.ctx.store.write_csv(&path));
            }

            SchedulerCommand::SaveSession { path, response } => {
                let _ = response.send(self.ctx.store.save_json(&path));
            }

            SchedulerCommand::LoadSession { path, response } => {
                let result = self.load_session(&path);
                let _ = response.send(result);
            }

            SchedulerCommand::GetStatus { response } => {
                let _ = response.send(self.status_report());
            }

            SchedulerCommand::Shutdown { response } => return ControlFlow::Break(response),
        }
        ControlFlow::Continue(())
    }

    /// Begin a run, or answer `response` with the reason it cannot start.
    fn start_run(&mut self, wells: Vec<Well>, response: oneshot::Sender<AppResult<RunSummary>>) {
        let checked = if self.run.is_some() {
            Err(ReaderError::RunInProgress)
        } else {
            self.selection(wells)
        };
        let selected = match checked {
            Ok(selected) => selected,
            Err(e) => {
                warn!("Cannot start acquisition: {}", e);
                let _ = response.send(Err(e));
                return;
            }
        };

        let tour = tour::plan(&self.grid, &selected);
        info!(
            "Starting acquisition of {} wells: {}",
            tour.len(),
            tour.iter().map(Well::to_string).collect::<Vec<_>>().join(" ")
        );
        self.run = Some(ActiveRun {
            acquisition: Acquisition::new(tour, self.settings.sampling_policy()),
            retries_at_start: self.ctx.channel.retries(),
            responder: Some(response),
        });
    }

    fn selection(&self, wells: Vec<Well>) -> AppResult<BTreeSet<Well>> {
        match wells.iter().find(|well| !self.grid.contains(well)) {
            Some(outside) => Err(ReaderError::InvalidWell(format!(
                "{} is outside the {}x{} plate",
                outside,
                self.grid.rows(),
                self.grid.cols()
            ))),
            None => Ok(wells.into_iter().collect()),
        }
    }

    fn stop_run(&mut self) -> bool {
        let light_off = match self.run.as_mut() {
            Some(run) => run.acquisition.stop(&mut self.ctx),
            None => return false,
        };
        if let Some(command) = light_off {
            self.dispatch(command);
        }
        self.finish_run();
        true
    }

    /// Answer the pending `read_selected` with the run's summary.
    fn finish_run(&mut self) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        let summary = RunSummary {
            tour: run.acquisition.planned().to_vec(),
            completed: run.acquisition.completed().to_vec(),
            stopped: run.acquisition.was_stopped(),
            retries: self.ctx.channel.retries() - run.retries_at_start,
        };
        info!(
            "Run finished: {}/{} wells{}, {} retries",
            summary.completed.len(),
            summary.tour.len(),
            if summary.stopped { " (stopped)" } else { "" },
            summary.retries
        );
        if let Some(responder) = run.responder.take() {
            let _ = responder.send(Ok(summary));
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let (issued, done) = match self.run.as_mut() {
            Some(run) => {
                let issued = run.acquisition.tick(&mut self.ctx, now);
                (issued, run.acquisition.is_done())
            }
            None => return,
        };
        for command in issued {
            self.dispatch(command);
        }
        if done {
            self.finish_run();
        }
    }

    fn request_status(&mut self) {
        if self.poll_in_flight {
            debug!("Previous status request still pending, skipping poll");
            return;
        }
        self.poll_in_flight = true;

        let link = Arc::clone(&self.link);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = link.poll_status().await;
            let _ = events.send(LinkEvent::Status(result));
        });
    }

    /// Send `command` in the background, or queue it behind the send in flight.
    fn dispatch(&mut self, command: Command) {
        if self.send_in_flight {
            if let Some(replaced) = self.queued.replace(command) {
                debug!("Queued command {} replaced by {}", replaced, command);
            }
            return;
        }
        self.send_in_flight = true;

        debug!("Dispatching {}", command);
        let link = Arc::clone(&self.link);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = link.send_command(&command).await;
            let _ = events.send(LinkEvent::Dispatched { command, result });
        });
    }

    fn schedule_retry(&self, command: Command) {
        let delay = self.settings.acquisition.retry_delay;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LinkEvent::RetryDue(command));
        });
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Dispatched { command, result } => {
                self.send_in_flight = false;
                match self.ctx.channel.on_dispatch_result(&command, result) {
                    DispatchOutcome::Delivered => self.last_delivered = Some(command.token),
                    DispatchOutcome::Superseded => {}
                    DispatchOutcome::Retry(command) => self.schedule_retry(command),
                    DispatchOutcome::Rejected(reason) => {
                        self.display
                            .notice(&format!("Command {} rejected: {}", command, reason));
                    }
                }
                if let Some(next) = self.queued.take() {
                    self.dispatch(next);
                }
            }
            LinkEvent::RetryDue(command) => {
                if self.ctx.channel.is_current(command.token) {
                    self.dispatch(command);
                } else {
                    debug!("Dropping retry of {}: superseded", command);
                }
            }
            LinkEvent::Status(result) => {
                self.poll_in_flight = false;
                self.poller
                    .on_poll_result(&mut self.ctx, result, self.display.as_mut());
            }
        }
    }

    fn load_session(&mut self, path: &Path) -> AppResult<()> {
        if self.run.is_some() {
            return Err(ReaderError::RunInProgress);
        }
        let store = ReadingsStore::load_json(path)?;
        let now = Instant::now();
        // New readings continue after the latest loaded one
        self.ctx.epoch = store
            .latest_time()
            .and_then(|latest| Duration::try_from_secs_f64(latest).ok())
            .and_then(|offset| now.checked_sub(offset))
            .unwrap_or(now);
        info!(
            "Loaded session '{}' ({} wells)",
            path.display(),
            store.all_wells().len()
        );
        self.ctx.store = store;
        Ok(())
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            status: self.ctx.status,
            status_text: status_text(self.ctx.status),
            sensor: self.ctx.sensor,
            active_well: self.ctx.active_well,
            parked_well: self.ctx.parked_well,
            latest_token: self.ctx.channel.latest_token(),
            run_active: self.run.is_some(),
            wells_recorded: self.ctx.store.all_wells().len(),
            readings: self.ctx.store.reading_count(),
        }
    }

    /// Stop any run and deliver a final light-off directly, after the send in
    /// flight has completed.
    ///
    /// With no run active, a latest command that left the lamp off but was never
    /// acknowledged (queued, awaiting retry or failed) is delivered instead.
    async fn shutdown(&mut self, events_rx: &mut mpsc::UnboundedReceiver<LinkEvent>) {
        self.queued = None;
        if self.send_in_flight {
            let pending = async {
                while let Some(event) = events_rx.recv().await {
                    if let LinkEvent::Dispatched { command, result } = event {
                        return result.is_ok().then_some(command.token);
                    }
                }
                None
            };
            match tokio::time::timeout(self.settings.link.timeout, pending).await {
                Ok(Some(token)) => self.last_delivered = Some(token),
                Ok(None) => {}
                Err(_) => warn!("Command send still pending at shutdown"),
            }
            self.send_in_flight = false;
        }

        let light_off = match self.run.as_mut() {
            Some(run) => run.acquisition.stop(&mut self.ctx),
            None => match self.ctx.channel.latest().copied() {
                Some(latest) if latest.light == LightPower::On => {
                    Some(self.ctx.issue(latest.target, LightPower::Off))
                }
                Some(latest) if self.last_delivered != Some(latest.token) => Some(latest),
                _ => None,
            },
        };
        self.finish_run();

        if let Some(command) = light_off {
            let policy = self.settings.shutdown_policy();
            match deliver_with_retry(self.link.as_ref(), &command, &policy).await {
                Ok(()) => info!("Light turned off at {}", command.target),
                Err(e) => warn!("Failed to turn light off at shutdown: {}", e),
            }
        }
    }
}

/// Cloneable handle to a running scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        (command, rx): (SchedulerCommand, oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ReaderError::SchedulerUnavailable)?;
        rx.await.map_err(|_| ReaderError::SchedulerUnavailable)
    }

    /// Plan a tour over `wells` and run it. Resolves when the run ends.
    ///
    /// # Errors
    /// `RunInProgress` if another run is active, `InvalidWell` for wells off
    /// the plate.
    pub async fn read_selected(&self, wells: Vec<Well>) -> AppResult<RunSummary> {
        self.request(SchedulerCommand::read_selected(wells)).await?
    }

    /// Stop the active run. Returns `false` if nothing was running.
    pub async fn stop(&self) -> AppResult<bool> {
        self.request(SchedulerCommand::stop()).await
    }

    /// Clear all readings and restart the reading clock.
    ///
    /// # Errors
    /// `RunInProgress` during a run.
    pub async fn reset(&self) -> AppResult<()> {
        self.request(SchedulerCommand::reset()).await?
    }

    /// The readings table as CSV text.
    pub async fn export(&self) -> AppResult<String> {
        self.request(SchedulerCommand::export()).await?
    }

    /// Write the readings table to a CSV file.
    pub async fn save_csv(&self, path: impl Into<PathBuf>) -> AppResult<()> {
        self.request(SchedulerCommand::save_csv(path.into())).await?
    }

    /// Save readings to a session file.
    pub async fn save_session(&self, path: impl Into<PathBuf>) -> AppResult<()> {
        self.request(SchedulerCommand::save_session(path.into()))
            .await?
    }

    /// Replace readings with a saved session.
    ///
    /// # Errors
    /// `RunInProgress` during a run, or file/format errors.
    pub async fn load_session(&self, path: impl Into<PathBuf>) -> AppResult<()> {
        self.request(SchedulerCommand::load_session(path.into()))
            .await?
    }

    /// Current device and run state.
    pub async fn status(&self) -> AppResult<StatusReport> {
        self.request(SchedulerCommand::get_status()).await
    }

    /// Stop any run, turn the lamp off and end the scheduler task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(SchedulerCommand::shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::LogDisplay;
    use crate::link::MockLink;

    fn spawn_with(link: MockLink) -> SchedulerHandle {
        Scheduler::new(Settings::default(), Arc::new(link), Box::new(LogDisplay::new())).spawn()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_wells_off_the_plate() {
        let handle = spawn_with(MockLink::new());
        let result = handle.read_selected(vec!["J1".parse().unwrap()]).await;
        assert!(matches!(result, Err(ReaderError::InvalidWell(_))));
        assert!(!handle.status().await.unwrap().run_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_rejected_while_active() {
        let link = MockLink::with_move_polls(1_000);
        let handle = spawn_with(link);

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.read_selected(vec!["A1".parse().unwrap()]).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let second = handle.read_selected(vec!["B1".parse().unwrap()]).await;
        assert!(matches!(second, Err(ReaderError::RunInProgress)));
        assert!(matches!(handle.reset().await, Err(ReaderError::RunInProgress)));

        assert!(handle.stop().await.unwrap());
        let summary = first.await.unwrap().unwrap();
        assert!(summary.stopped);
        assert!(summary.completed.is_empty());
        assert!(!handle.stop().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_selection_finishes_immediately() {
        let link = MockLink::new();
        let handle = spawn_with(link.clone());
        let summary = handle.read_selected(Vec::new()).await.unwrap();
        assert!(summary.tour.is_empty());
        assert!(!summary.stopped);
        assert!(link.received_commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_command_breaks_the_loop() {
        let mut scheduler = Scheduler::new(
            Settings::default(),
            Arc::new(MockLink::new()),
            Box::new(LogDisplay::new()),
        );
        let (command, mut rx) = SchedulerCommand::shutdown();
        let flow = scheduler.handle_command(command);
        assert!(flow.is_break());
        // Acknowledged by the loop only after shutting down
        assert!(rx.try_recv().is_err());

        let (command, _rx) = SchedulerCommand::get_status();
        assert!(scheduler.handle_command(command).is_continue());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_fails_after_shutdown() {
        let handle = spawn_with(MockLink::new());
        handle.shutdown().await.unwrap();
        assert!(matches!(
            handle.status().await,
            Err(ReaderError::SchedulerUnavailable)
        ));
    }
}
