//! Message types for actor-based communication
//!
//! This module defines the command and response types used for message-passing
//! between a [`SchedulerHandle`](crate::scheduler::SchedulerHandle) and the
//! scheduler task. Every command carries a oneshot sender for its reply.

use crate::error::AppResult;
use crate::link::{StatusCode, Token};
use crate::well::Well;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Outcome of one acquisition run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Wells in planned visiting order
    pub tour: Vec<Well>,
    /// Wells whose sampling finished
    pub completed: Vec<Well>,
    /// True if the run was stopped before the tour was exhausted
    pub stopped: bool,
    /// Command resends caused by transport failures during the run
    pub retries: u64,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Status from the latest current snapshot
    pub status: StatusCode,
    /// Operator-facing text for `status`
    pub status_text: &'static str,
    /// Latest raw sensor value
    pub sensor: Option<f64>,
    /// Well being sampled
    pub active_well: Option<Well>,
    /// Well the stage was last confirmed over
    pub parked_well: Option<Well>,
    /// Token of the most recent command
    pub latest_token: Option<Token>,
    /// True while a run is in progress
    pub run_active: bool,
    /// Wells with a series in the store
    pub wells_recorded: usize,
    /// Readings across all wells
    pub readings: usize,
}

/// Commands that can be sent to the scheduler task
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Plan and run an acquisition over the given wells; replies when the run ends
    ReadSelected {
        /// Wells to read, in any order
        wells: Vec<Well>,
        /// Reply channel
        response: oneshot::Sender<AppResult<RunSummary>>,
    },

    /// Stop the active run, if any
    Stop {
        /// Reply channel
        response: oneshot::Sender<bool>,
    },

    /// Clear the readings store
    Reset {
        /// Reply channel
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Render the store as CSV
    Export {
        /// Reply channel
        response: oneshot::Sender<AppResult<String>>,
    },

    /// Write the CSV export to a file
    SaveCsv {
        /// Destination CSV file
        path: PathBuf,
        /// Reply channel
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Save the store as a session file
    SaveSession {
        /// Destination session file
        path: PathBuf,
        /// Reply channel
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Replace the store with a saved session
    LoadSession {
        /// Session file to load
        path: PathBuf,
        /// Reply channel
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Report device and run state
    GetStatus {
        /// Reply channel
        response: oneshot::Sender<StatusReport>,
    },

    /// Stop any run, turn the lamp off and exit
    Shutdown {
        /// Reply channel
        response: oneshot::Sender<()>,
    },
}

impl SchedulerCommand {
    /// Helper to create a ReadSelected command
    pub fn read_selected(wells: Vec<Well>) -> (Self, oneshot::Receiver<AppResult<RunSummary>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ReadSelected {
                wells,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Stop command
    pub fn stop() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    /// Helper to create a Reset command
    pub fn reset() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Reset { response: tx }, rx)
    }

    /// Helper to create an Export command
    pub fn export() -> (Self, oneshot::Receiver<AppResult<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Export { response: tx }, rx)
    }

    /// Helper to create a SaveCsv command
    pub fn save_csv(path: PathBuf) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SaveCsv { path, response: tx }, rx)
    }

    /// Helper to create a SaveSession command
    pub fn save_session(path: PathBuf) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SaveSession { path, response: tx }, rx)
    }

    /// Helper to create a LoadSession command
    pub fn load_session(path: PathBuf) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::LoadSession { path, response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<StatusReport>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_wires_response_channel() {
        let (command, rx) = SchedulerCommand::stop();
        match command {
            SchedulerCommand::Stop { response } => response.send(true).unwrap(),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(rx.blocking_recv(), Ok(true));
    }

    #[test]
    fn test_run_summary_serializes_well_names() {
        let summary = RunSummary {
            tour: vec!["A1".parse().unwrap(), "B2".parse().unwrap()],
            completed: vec!["A1".parse().unwrap()],
            stopped: true,
            retries: 2,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert_eq!(
            json,
            r#"{"tour":["A1","B2"],"completed":["A1"],"stopped":true,"retries":2}"#
        );
    }
}
