//! Configuration System using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`plate_reader.toml` or the path given on the command line)
//! 3. Environment variables prefixed with `PLATE_READER_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! PLATE_READER_PLATE__COLS=6
//! PLATE_READER_ACQUISITION__POLL_INTERVAL=250ms
//! PLATE_READER_LINK__KIND=serial
//! PLATE_READER_LINK__PORT=/dev/ttyUSB0
//! ```
//!
//! # Example
//!
//! ```toml
//! [plate]
//! rows = 8
//! cols = 12
//!
//! [acquisition]
//! poll_interval = "500ms"
//! tick_interval = "250ms"
//! settle_samples = 1
//! recorded_samples = 1
//! retry_delay = "100ms"
//!
//! [link]
//! kind = "serial"
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! timeout = "1s"
//! ```

use crate::acquisition::SamplingPolicy;
use crate::display::Calibration;
use crate::recovery::RetryPolicy;
use crate::well::PlateGrid;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "plate_reader.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "PLATE_READER_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not merge or extract the layered configuration.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are not usable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Plate geometry
    pub plate: PlateSettings,
    /// Scheduler cadence and sampling policy
    pub acquisition: AcquisitionSettings,
    /// Device link selection and parameters
    pub link: LinkSettings,
    /// Delivery of the final light-off when shutting down
    pub shutdown: ShutdownSettings,
    /// Export location
    pub storage: StorageSettings,
    /// Raw sensor to optical density conversion
    pub calibration: CalibrationSettings,
}

/// Plate geometry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlateSettings {
    /// Number of rows (lettered A..)
    pub rows: u8,
    /// Number of columns (numbered from 1)
    pub cols: u8,
}

/// Scheduler cadence and sampling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Period of the status/sensor poller
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Period of the acquisition state machine tick
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Samples discarded after the lamp comes on
    pub settle_samples: u32,
    /// Samples recorded per well after settling
    pub recorded_samples: u32,
    /// Delay before re-sending a command the transport failed to deliver
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

/// Which device link implementation to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Simulated plate reader
    Mock,
    /// Line protocol over a serial port
    Serial,
}

/// Device link parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkSettings {
    /// Link implementation
    pub kind: LinkKind,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Per-request reply timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Polls the simulated stage reports `moving` after a move command
    pub mock_move_polls: u32,
}

/// Bounded retry used outside the run loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Attempts at delivering the final light-off
    pub max_attempts: u32,
    /// Delay between attempts
    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,
}

/// Export location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory that receives CSV exports
    pub output_dir: PathBuf,
}

/// Linear sensor calibration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Raw reading that corresponds to zero optical density
    pub dark_offset: f64,
    /// Raw counts per unit of optical density
    pub slope: f64,
}

impl Default for PlateSettings {
    fn default() -> Self {
        Self { rows: 8, cols: 12 }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            tick_interval: Duration::from_millis(250),
            settle_samples: 1,
            recorded_samples: 1,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            kind: LinkKind::Mock,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            timeout: Duration::from_secs(1),
            mock_move_polls: 2,
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            dark_offset: 2836.0,
            slope: -378.0,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plate: PlateSettings::default(),
            acquisition: AcquisitionSettings::default(),
            link: LinkSettings::default(),
            shutdown: ShutdownSettings::default(),
            storage: StorageSettings::default(),
            calibration: CalibrationSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, a TOML file and the environment.
    ///
    /// With `path == None` the default file is used if it exists. An explicit path
    /// that does not exist is an error.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the layers cannot be merged or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::ValidationError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }

        let settings: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=26).contains(&self.plate.rows) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid plate rows {}. Must be 1-26",
                self.plate.rows
            )));
        }
        if self.plate.cols == 0 {
            return Err(ConfigError::ValidationError(
                "Plate must have at least one column".to_string(),
            ));
        }
        if self.acquisition.recorded_samples == 0 {
            return Err(ConfigError::ValidationError(
                "recorded_samples must be at least 1".to_string(),
            ));
        }
        if self.acquisition.poll_interval.is_zero() || self.acquisition.tick_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll_interval and tick_interval must be non-zero".to_string(),
            ));
        }
        if self.shutdown.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "shutdown.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.calibration.slope == 0.0 {
            return Err(ConfigError::ValidationError(
                "calibration.slope must be non-zero".to_string(),
            ));
        }
        if self.link.kind == LinkKind::Serial && self.link.port.is_empty() {
            return Err(ConfigError::ValidationError(
                "link.port cannot be empty for a serial link".to_string(),
            ));
        }
        Ok(())
    }

    /// Plate grid described by these settings.
    pub fn grid(&self) -> PlateGrid {
        PlateGrid::new(self.plate.rows, self.plate.cols)
    }

    /// Sampling policy for the acquisition state machine.
    pub fn sampling_policy(&self) -> SamplingPolicy {
        SamplingPolicy {
            settle_samples: self.acquisition.settle_samples,
            recorded_samples: self.acquisition.recorded_samples,
        }
    }

    /// Calibration handed to the display.
    pub fn calibration(&self) -> Calibration {
        Calibration {
            dark_offset: self.calibration.dark_offset,
            slope: self.calibration.slope,
        }
    }

    /// Retry policy for the final light-off at shutdown.
    pub fn shutdown_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.shutdown.max_attempts,
            backoff_delay: self.shutdown.backoff_delay,
        }
    }
}
