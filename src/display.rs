//! Display collaborator.
//!
//! The scheduler pushes status text and the latest raw sensor value to a
//! [`StatusDisplay`]; how they are shown is up to the implementation. The
//! default [`LogDisplay`] writes them to the tracing log.

use crate::link::StatusCode;
use tracing::{debug, info, warn};

/// One status publication.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayUpdate {
    /// Device status
    pub status: StatusCode,
    /// Human-readable status
    pub text: &'static str,
    /// Latest raw sensor value
    pub sensor: Option<f64>,
    /// Sensor value converted with the configured calibration
    pub optical_density: Option<f64>,
}

impl DisplayUpdate {
    /// Build an update from a status and raw reading.
    pub fn new(status: StatusCode, sensor: Option<f64>, calibration: &Calibration) -> Self {
        Self {
            status,
            text: status_text(status),
            sensor,
            optical_density: sensor.map(|raw| calibration.optical_density(raw)),
        }
    }
}

/// Receives values to present. No return values; displays cannot stall the scheduler.
pub trait StatusDisplay: Send {
    /// A status snapshot was accepted.
    fn update(&mut self, update: &DisplayUpdate);

    /// Something the operator should know about (device anomaly, rejected command).
    fn notice(&mut self, message: &str);
}

/// Operator-facing text for a status code.
pub fn status_text(status: StatusCode) -> &'static str {
    match status {
        StatusCode::AwaitingUpdate => "Awaiting status update...",
        StatusCode::Initializing => "Device initialising...",
        StatusCode::Ready => "Ready for reading!",
        StatusCode::Homing => "Homing device, please wait...",
        StatusCode::Moving => "Moving to position...",
        StatusCode::Reading => "Reading absorbance...",
        StatusCode::Unknown => "Unknown status",
    }
}

/// Linear conversion from raw sensor counts to optical density.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Raw reading at zero optical density
    pub dark_offset: f64,
    /// Raw counts per unit optical density (negative: darker samples read lower)
    pub slope: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            dark_offset: 2836.0,
            slope: -378.0,
        }
    }
}

impl Calibration {
    /// `(raw - dark_offset) / slope`
    pub fn optical_density(&self, raw: f64) -> f64 {
        (raw - self.dark_offset) / self.slope
    }
}

/// Display that writes to the tracing log.
///
/// Status changes are logged at info level, repeated statuses at debug level.
#[derive(Debug, Default)]
pub struct LogDisplay {
    last_status: Option<StatusCode>,
}

impl LogDisplay {
    /// New log display.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusDisplay for LogDisplay {
    fn update(&mut self, update: &DisplayUpdate) {
        let reading = match (update.sensor, update.optical_density) {
            (Some(raw), Some(od)) => format!("{} (OD {:.3})", raw, od),
            _ => "-".to_string(),
        };
        if self.last_status != Some(update.status) {
            info!("{} sensor={}", update.text, reading);
            self.last_status = Some(update.status);
        } else {
            debug!("{} sensor={}", update.text, reading);
        }
    }

    fn notice(&mut self, message: &str) {
        warn!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(StatusCode::Ready), "Ready for reading!");
        assert_eq!(status_text(StatusCode::Moving), "Moving to position...");
        assert_eq!(status_text(StatusCode::Unknown), "Unknown status");
    }

    #[test]
    fn test_optical_density() {
        let calibration = Calibration::default();
        assert_eq!(calibration.optical_density(2836.0), 0.0);
        assert!((calibration.optical_density(2458.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_carries_density() {
        let update = DisplayUpdate::new(StatusCode::Ready, Some(2458.0), &Calibration::default());
        assert_eq!(update.text, "Ready for reading!");
        assert!((update.optical_density.unwrap() - 1.0).abs() < 1e-9);

        let empty = DisplayUpdate::new(StatusCode::Initializing, None, &Calibration::default());
        assert_eq!(empty.optical_density, None);
    }

    #[traced_test]
    #[test]
    fn test_log_display_reports_status_changes() {
        let mut display = LogDisplay::new();
        display.update(&DisplayUpdate::new(
            StatusCode::Moving,
            None,
            &Calibration::default(),
        ));
        display.notice("Device reported an unknown status");
        assert!(logs_contain("Moving to position..."));
        assert!(logs_contain("unknown status"));
    }
}
