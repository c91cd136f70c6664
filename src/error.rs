//! Custom error types for the application.
//!
//! This module defines the primary error type, `ReaderError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can surface from the scheduler, from configuration loading to
//! file export.
//!
//! ## Error Hierarchy
//!
//! `ReaderError` is an enum that consolidates the error sources:
//!
//! - **`Config`**: Wraps [`ConfigError`], raised while loading or validating settings.
//! - **`InvalidWell`**: A well identity that does not parse or lies outside the plate grid.
//! - **`Link`**: Wraps [`LinkError`] from the device link. Inside a run these are
//!   recovered or surfaced to the display; they only reach callers from direct link use.
//! - **`Io`**, **`Csv`**, **`Json`**: Export and session persistence failures.
//! - **`RunInProgress`**: An operation that needs an idle scheduler was requested mid-run.
//! - **`SchedulerUnavailable`**: The scheduler task has exited and can no longer answer.
//!
//! None of these are fatal to the acquisition loop itself. The worst outcome of a
//! misbehaving device is indefinite waiting, which is visible on the display.

use crate::config::ConfigError;
use crate::link::LinkError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ReaderError>;

/// Errors surfaced by the plate reader crate.
#[derive(Error, Debug)]
pub enum ReaderError {
    /// Settings could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A well name that does not parse or is off the plate.
    #[error("Invalid well: {0}")]
    InvalidWell(String),

    /// The device link reported a failure.
    #[error("Device link error: {0}")]
    Link(#[from] LinkError),

    /// Filesystem failure during export or session persistence.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Session snapshot encoding/decoding failure.
    #[error("Session format error: {0}")]
    Json(#[from] serde_json::Error),

    /// Export produced bytes that are not valid UTF-8.
    #[error("Export encoding error: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    /// Only one acquisition run may be active at a time.
    #[error("An acquisition run is already in progress")]
    RunInProgress,

    /// The scheduler task is gone.
    #[error("Scheduler is not running")]
    SchedulerUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReaderError::InvalidWell("Z99".to_string());
        assert_eq!(err.to_string(), "Invalid well: Z99");
    }

    #[test]
    fn test_link_error_wraps() {
        let err: ReaderError = LinkError::Rejected("bad target".into()).into();
        assert!(err.to_string().contains("bad target"));
    }
}
