//! Tour planning: order selected wells into a visiting sequence.
//!
//! Greedy nearest neighbour. The tour starts at the first selected well in
//! raster order; from each well the closest remaining well is visited next,
//! ties going to the lower raster index. This is an O(n²) approximation of the
//! travelling-salesman tour. It is not optimal, but it is deterministic and
//! keeps consecutive wells close together.

use crate::well::{PlateGrid, Well};
use std::collections::{BTreeSet, VecDeque};

/// Ordered visiting sequence for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tour {
    wells: VecDeque<Well>,
}

impl Tour {
    /// Tour that visits `wells` in the given order.
    pub fn from_wells(wells: impl IntoIterator<Item = Well>) -> Self {
        Self {
            wells: wells.into_iter().collect(),
        }
    }

    /// Next well to visit.
    pub fn head(&self) -> Option<&Well> {
        self.wells.front()
    }

    /// Remove and return the next well.
    pub fn pop(&mut self) -> Option<Well> {
        self.wells.pop_front()
    }

    /// Drop every remaining well.
    pub fn clear(&mut self) {
        self.wells.clear();
    }

    /// Remaining wells.
    pub fn len(&self) -> usize {
        self.wells.len()
    }

    /// True when no wells remain.
    pub fn is_empty(&self) -> bool {
        self.wells.is_empty()
    }

    /// Remaining wells in visiting order.
    pub fn iter(&self) -> impl Iterator<Item = &Well> {
        self.wells.iter()
    }

    /// Remaining wells as a vector.
    pub fn to_vec(&self) -> Vec<Well> {
        self.wells.iter().copied().collect()
    }
}

/// Order `selected` into a nearest-neighbour tour.
pub fn plan(grid: &PlateGrid, selected: &BTreeSet<Well>) -> Tour {
    if selected.len() <= 1 {
        return Tour::from_wells(selected.iter().copied());
    }

    let mut remaining: Vec<Well> = selected.iter().copied().collect();
    let mut order = Vec::with_capacity(remaining.len());
    let mut current = remaining.remove(0);

    loop {
        order.push(current);
        // Squared distance orders the same as the Euclidean distance and stays exact.
        let next = remaining
            .iter()
            .enumerate()
            .min_by_key(|(_, well)| {
                (
                    current.distance_squared(well),
                    grid.linear_index(well),
                )
            })
            .map(|(index, _)| index);

        match next {
            Some(index) => current = remaining.swap_remove(index),
            None => break,
        }
    }

    Tour::from_wells(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wells(names: &[&str]) -> BTreeSet<Well> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    fn names(tour: &Tour) -> Vec<String> {
        tour.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_empty_and_single() {
        let grid = PlateGrid::default();
        assert!(plan(&grid, &BTreeSet::new()).is_empty());
        assert_eq!(names(&plan(&grid, &wells(&["D4"]))), vec!["D4"]);
    }

    #[test]
    fn test_equidistant_tie_prefers_lower_raster_index() {
        let grid = PlateGrid::default();
        // A2 and B1 are both one step from A1; A2 has the lower raster index.
        let tour = plan(&grid, &wells(&["A1", "A2", "B1"]));
        assert_eq!(names(&tour), vec!["A1", "A2", "B1"]);
    }

    #[test]
    fn test_three_way_tie_around_centre() {
        // From C3 the wells C2, C4 and D3 are all one step away; C2 has the
        // lowest raster index, then D3 is closer to C2 than C4 is.
        let grid = PlateGrid::default();
        let tour = plan(&grid, &wells(&["C3", "B3", "C2", "C4", "D3"]));
        assert_eq!(names(&tour), vec!["B3", "C3", "C2", "D3", "C4"]);
    }

    #[test]
    fn test_nearest_neighbour_order() {
        let grid = PlateGrid::default();
        let tour = plan(&grid, &wells(&["A1", "A12", "A2", "H12", "A3"]));
        assert_eq!(names(&tour), vec!["A1", "A2", "A3", "A12", "H12"]);
    }

    #[test]
    fn test_plan_is_a_permutation() {
        let grid = PlateGrid::default();
        let selected = wells(&["A1", "C7", "H12", "B3", "E5", "E6", "G2", "A12", "D9"]);
        let tour = plan(&grid, &selected);
        assert_eq!(tour.len(), selected.len());
        let visited: BTreeSet<Well> = tour.iter().copied().collect();
        assert_eq!(visited, selected);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let grid = PlateGrid::default();
        let selected: BTreeSet<Well> = grid.wells().step_by(7).collect();
        assert_eq!(plan(&grid, &selected), plan(&grid, &selected));
    }

    #[test]
    fn test_pop_removes_head() {
        let grid = PlateGrid::default();
        let mut tour = plan(&grid, &wells(&["A1", "A2"]));
        assert_eq!(tour.pop().map(|w| w.to_string()), Some("A1".to_string()));
        assert_eq!(tour.len(), 1);
    }
}
