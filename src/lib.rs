//! Core library for the plate_reader application.
//!
//! Acquisition scheduler for a motorized multi-well plate reader. Selected wells
//! are ordered into a tour, each visit is driven through a token-synchronised
//! command/acknowledge exchange with the stage controller, sensor samples are
//! taken once the stage reports ready, and the resulting series are exported
//! as CSV.
//!
//! The entry point is [`scheduler::Scheduler`]; everything it owns lives in a
//! single Tokio task and is reached through a [`scheduler::SchedulerHandle`].

pub mod acquisition;
pub mod channel;
pub mod config;
pub mod context;
pub mod display;
pub mod error;
pub mod link;
pub mod messages;
pub mod poller;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod tour;
pub mod well;

pub use error::{AppResult, ReaderError};
