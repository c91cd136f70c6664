//! Well addressing on the plate grid.
//!
//! A well is named by its row letter and column number (`"C5"` is row 3,
//! column 5). Coordinates are 1-based. Wells order by `(row, col)`, which is
//! the same as raster order on any grid the well fits in.

use crate::error::{AppResult, ReaderError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One sample position on the plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Well {
    row: u8,
    col: u8,
}

impl Well {
    /// Build a well from 1-based coordinates.
    ///
    /// # Errors
    /// Rows must be 1-26 (one letter), columns at least 1.
    pub fn new(row: u8, col: u8) -> AppResult<Self> {
        if !(1..=26).contains(&row) || col == 0 {
            return Err(ReaderError::InvalidWell(format!("({}, {})", row, col)));
        }
        Ok(Self { row, col })
    }

    /// 1-based row (A = 1).
    pub fn row(&self) -> u8 {
        self.row
    }

    /// 1-based column.
    pub fn col(&self) -> u8 {
        self.col
    }

    /// Row letter.
    pub fn row_letter(&self) -> char {
        char::from(b'A' + self.row - 1)
    }

    /// Squared Euclidean distance in grid units.
    pub fn distance_squared(&self, other: &Well) -> u32 {
        let dr = i32::from(self.row) - i32::from(other.row);
        let dc = i32::from(self.col) - i32::from(other.col);
        (dr * dr + dc * dc) as u32
    }

    /// Euclidean distance in grid units.
    pub fn distance(&self, other: &Well) -> f64 {
        f64::from(self.distance_squared(other)).sqrt()
    }
}

impl fmt::Display for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row_letter(), self.col)
    }
}

impl FromStr for Well {
    type Err = ReaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let letter = chars
            .next()
            .filter(char::is_ascii_alphabetic)
            .ok_or_else(|| ReaderError::InvalidWell(s.to_string()))?;
        let col: u8 = chars
            .as_str()
            .parse()
            .map_err(|_| ReaderError::InvalidWell(s.to_string()))?;
        let row = letter.to_ascii_uppercase() as u8 - b'A' + 1;
        Well::new(row, col).map_err(|_| ReaderError::InvalidWell(s.to_string()))
    }
}

impl TryFrom<String> for Well {
    type Error = ReaderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Well> for String {
    fn from(well: Well) -> Self {
        well.to_string()
    }
}

/// Plate dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlateGrid {
    rows: u8,
    cols: u8,
}

impl Default for PlateGrid {
    /// Standard 96-well plate.
    fn default() -> Self {
        Self { rows: 8, cols: 12 }
    }
}

impl PlateGrid {
    /// Grid of `rows` x `cols` wells.
    pub fn new(rows: u8, cols: u8) -> Self {
        Self { rows, cols }
    }

    /// Number of rows.
    pub fn rows(&self) -> u8 {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> u8 {
        self.cols
    }

    /// True if the well lies on this plate.
    pub fn contains(&self, well: &Well) -> bool {
        well.row <= self.rows && well.col <= self.cols
    }

    /// Row-major raster index, `(row-1) * cols + col`.
    pub fn linear_index(&self, well: &Well) -> u32 {
        (u32::from(well.row) - 1) * u32::from(self.cols) + u32::from(well.col)
    }

    /// Parse a well name and check it lies on this plate.
    ///
    /// # Errors
    /// `InvalidWell` if the name is malformed or off the plate.
    pub fn well(&self, name: &str) -> AppResult<Well> {
        let well: Well = name.parse()?;
        if !self.contains(&well) {
            return Err(ReaderError::InvalidWell(format!(
                "{} is outside the {}x{} plate",
                well, self.rows, self.cols
            )));
        }
        Ok(well)
    }

    /// All wells in raster order.
    pub fn wells(&self) -> impl Iterator<Item = Well> + '_ {
        (1..=self.rows).flat_map(move |row| (1..=self.cols).map(move |col| Well { row, col }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let well: Well = "C5".parse().unwrap();
        assert_eq!(well.row(), 3);
        assert_eq!(well.col(), 5);
        assert_eq!(well.to_string(), "C5");

        let lower: Well = "h12".parse().unwrap();
        assert_eq!(lower.to_string(), "H12");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Well>().is_err());
        assert!("5C".parse::<Well>().is_err());
        assert!("A0".parse::<Well>().is_err());
        assert!("A".parse::<Well>().is_err());
        assert!("AA1".parse::<Well>().is_err());
    }

    #[test]
    fn test_grid_bounds() {
        let grid = PlateGrid::default();
        assert!(grid.well("H12").is_ok());
        assert!(grid.well("I1").is_err());
        assert!(grid.well("A13").is_err());
    }

    #[test]
    fn test_name_coordinate_bijection() {
        let grid = PlateGrid::default();
        let mut seen = std::collections::HashSet::new();
        for well in grid.wells() {
            let name = well.to_string();
            assert_eq!(grid.well(&name).unwrap(), well);
            assert!(seen.insert(name));
        }
        assert_eq!(seen.len(), 96);
    }

    #[test]
    fn test_linear_index_is_raster_order() {
        let grid = PlateGrid::default();
        let indices: Vec<u32> = grid.wells().map(|w| grid.linear_index(&w)).collect();
        assert_eq!(indices.first(), Some(&1));
        assert_eq!(indices.last(), Some(&96));
        assert!(indices.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_distance() {
        let a1: Well = "A1".parse().unwrap();
        let b2: Well = "B2".parse().unwrap();
        assert_eq!(a1.distance_squared(&b2), 2);
        assert!((a1.distance(&b2) - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_serde_as_name() {
        let well: Well = "B7".parse().unwrap();
        let json = serde_json::to_string(&well).unwrap();
        assert_eq!(json, "\"B7\"");
        let back: Well = serde_json::from_str(&json).unwrap();
        assert_eq!(back, well);
    }
}
