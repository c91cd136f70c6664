//! Readings store and CSV export.
//!
//! Each well that has been made active owns an append-only series of readings in
//! capture order. The store keeps wells in first-activation order, which is also
//! the column order of the exported table.
//!
//! # Export format
//!
//! ```text
//! TA1,A1,TB2,B2
//! 0,100,0,90
//! 1,110,,
//! ```
//!
//! One row per sample index across all wells; a well with fewer samples leaves
//! its pair of cells empty. Rows continue until every series is exhausted.

use crate::error::AppResult;
use crate::well::Well;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// One timestamped sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Seconds since the store's epoch, millisecond resolution
    pub time: f64,
    /// Raw sensor value
    pub value: f64,
}

impl Reading {
    /// Reading at `elapsed_secs`, rounded to milliseconds.
    pub fn new(elapsed_secs: f64, value: f64) -> Self {
        Self {
            time: (elapsed_secs * 1000.0).round() / 1000.0,
            value,
        }
    }
}

/// Per-well series of readings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingsStore {
    wells: Vec<Well>,
    series: HashMap<Well, Vec<Reading>>,
}

#[derive(Serialize, Deserialize)]
struct SessionFile {
    wells: Vec<SessionWell>,
}

#[derive(Serialize, Deserialize)]
struct SessionWell {
    well: Well,
    readings: Vec<Reading>,
}

impl ReadingsStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a series for `well` if it has none.
    pub fn activate(&mut self, well: Well) {
        if !self.series.contains_key(&well) {
            self.wells.push(well);
            self.series.insert(well, Vec::new());
        }
    }

    /// Append a reading to `well`'s series.
    pub fn append(&mut self, well: Well, reading: Reading) {
        self.activate(well);
        if let Some(series) = self.series.get_mut(&well) {
            series.push(reading);
        }
    }

    /// Wells in first-activation order.
    pub fn all_wells(&self) -> &[Well] {
        &self.wells
    }

    /// Series for `well`, if it has been activated.
    pub fn series(&self, well: &Well) -> Option<&[Reading]> {
        self.series.get(well).map(Vec::as_slice)
    }

    /// Total readings across all wells.
    pub fn reading_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// Largest reading time in the store.
    pub fn latest_time(&self) -> Option<f64> {
        self.series
            .values()
            .flatten()
            .map(|reading| reading.time)
            .reduce(f64::max)
    }

    /// True if no well has been activated.
    pub fn is_empty(&self) -> bool {
        self.wells.is_empty()
    }

    /// Drop every well and reading.
    pub fn clear(&mut self) {
        self.wells.clear();
        self.series.clear();
    }

    /// Render the wide CSV table.
    ///
    /// An empty store exports as an empty string; wells without readings export
    /// as a header row only.
    ///
    /// # Errors
    /// Only if the CSV encoder fails, which does not happen for numeric cells.
    pub fn export(&self) -> AppResult<String> {
        if self.wells.is_empty() {
            return Ok(String::new());
        }

        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        let header: Vec<String> = self
            .wells
            .iter()
            .flat_map(|well| [format!("T{}", well), well.to_string()])
            .collect();
        writer.write_record(&header)?;

        let depth = self.series.values().map(Vec::len).max().unwrap_or(0);
        for index in 0..depth {
            let row: Vec<String> = self
                .wells
                .iter()
                .flat_map(|well| {
                    match self.series.get(well).and_then(|series| series.get(index)) {
                        Some(reading) => [reading.time.to_string(), reading.value.to_string()],
                        None => [String::new(), String::new()],
                    }
                })
                .collect();
            writer.write_record(&row)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Write the CSV table to `path`, creating parent directories.
    ///
    /// # Errors
    /// Filesystem errors.
    pub fn write_csv(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.export()?)?;
        info!(
            "Exported {} wells ({} readings) to '{}'",
            self.wells.len(),
            self.reading_count(),
            path.display()
        );
        Ok(())
    }

    /// Save the store as a JSON session file.
    ///
    /// # Errors
    /// Filesystem or encoding errors.
    pub fn save_json(&self, path: &Path) -> AppResult<()> {
        let session = SessionFile {
            wells: self
                .wells
                .iter()
                .map(|well| SessionWell {
                    well: *well,
                    readings: self.series.get(well).cloned().unwrap_or_default(),
                })
                .collect(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&session)?)?;
        info!("Session saved to '{}'", path.display());
        Ok(())
    }

    /// Load a store from a JSON session file.
    ///
    /// # Errors
    /// Filesystem or decoding errors.
    pub fn load_json(path: &Path) -> AppResult<Self> {
        let session: SessionFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let mut store = Self::new();
        for entry in session.wells {
            store.activate(entry.well);
            for reading in entry.readings {
                store.append(entry.well, reading);
            }
        }
        Ok(store)
    }
}

/// Timestamped export file name inside `dir`.
pub fn default_export_path(dir: &Path) -> PathBuf {
    dir.join(format!(
        "plate_readings_{}.csv",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ))
}
