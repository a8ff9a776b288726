//! Fuel Maps
//!
//! Per-cylinder, per-profile RPM × MAP correction grids.
//!
//! A [`FuelMap`] is plain data: an N×N grid of correction factors bounded to
//! [`MIN_VALUE`, `MAX_VALUE`], plus the axis ranges used to locate a cell.
//! Grid dimensions never change after creation; refining to a finer stage
//! produces a new map via [`FuelMap::rebin`].

mod error;
mod store;

pub use error::PersistenceError;
pub use store::FuelMapStore;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest correction factor a cell may hold
pub const MIN_VALUE: f64 = 1.0;

/// Highest correction factor a cell may hold
pub const MAX_VALUE: f64 = 20.0;

/// Default RPM axis bounds
pub const DEFAULT_RPM_RANGE: AxisRange = AxisRange(1000.0, 6500.0);

/// Default MAP axis bounds (kPa)
pub const DEFAULT_MAP_RANGE: AxisRange = AxisRange(20.0, 100.0);

/// Tuning profile a map belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Efficiency,
    Performance,
}

impl Profile {
    pub const ALL: [Profile; 2] = [Profile::Efficiency, Profile::Performance];

    /// Lowercase name used in file names and on the display
    pub fn name(&self) -> &'static str {
        match self {
            Profile::Efficiency => "efficiency",
            Profile::Performance => "performance",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inclusive `(min, max)` bounds of one grid axis, serialized as `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange(pub f64, pub f64);

impl AxisRange {
    pub fn min(&self) -> f64 {
        self.0
    }

    pub fn max(&self) -> f64 {
        self.1
    }

    pub fn is_increasing(&self) -> bool {
        self.0.is_finite() && self.1.is_finite() && self.0 < self.1
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.0 && value <= self.1
    }

    /// Truncated bin index of `value`, clamped to `[0, resolution - 1]`
    fn bin(&self, value: f64, resolution: usize) -> usize {
        let position = (value - self.0) / (self.1 - self.0) * resolution as f64;
        // `as usize` saturates negatives and NaN to 0
        (position.floor() as usize).min(resolution - 1)
    }
}

/// Grid coordinates of one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell {
    pub rpm: usize,
    pub map: usize,
}

/// Adaptive fuel correction grid for one (profile, cylinder)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFuelMap")]
pub struct FuelMap {
    resolution: usize,
    rpm_range: AxisRange,
    map_range: AxisRange,
    /// `values[rpm][map]`
    values: Vec<Vec<f64>>,
    dyno_learned: bool,
}

#[derive(Deserialize)]
struct RawFuelMap {
    resolution: usize,
    rpm_range: AxisRange,
    map_range: AxisRange,
    values: Vec<Vec<f64>>,
    #[serde(default)]
    dyno_learned: bool,
}

impl TryFrom<RawFuelMap> for FuelMap {
    type Error = PersistenceError;

    fn try_from(raw: RawFuelMap) -> Result<Self, Self::Error> {
        let invalid =
            |msg: String| -> Result<FuelMap, PersistenceError> { Err(PersistenceError::InvalidMap(msg)) };

        if raw.resolution == 0 {
            return invalid("resolution must be positive".into());
        }
        if !raw.rpm_range.is_increasing() || !raw.map_range.is_increasing() {
            return invalid("axis ranges must be strictly increasing".into());
        }
        if raw.values.len() != raw.resolution
            || raw.values.iter().any(|row| row.len() != raw.resolution)
        {
            return invalid(format!("grid is not {0}x{0}", raw.resolution));
        }
        if let Some(v) = raw
            .values
            .iter()
            .flatten()
            .find(|v| !(MIN_VALUE..=MAX_VALUE).contains(*v))
        {
            return invalid(format!("cell value {v} outside [{MIN_VALUE}, {MAX_VALUE}]"));
        }

        Ok(FuelMap {
            resolution: raw.resolution,
            rpm_range: raw.rpm_range,
            map_range: raw.map_range,
            values: raw.values,
            dyno_learned: raw.dyno_learned,
        })
    }
}

impl FuelMap {
    /// Deterministic starting map: a linear ramp over both axes, offset per
    /// cylinder so that maps are distinguishable before any learning
    pub fn seeded(cylinder: u8, resolution: usize) -> Self {
        let resolution = resolution.max(1);
        let offset = 0.1 * f64::from(cylinder.saturating_sub(1));
        let values = (0..resolution)
            .map(|i| {
                (0..resolution)
                    .map(|j| (2.0 + 0.2 * i as f64 + 0.2 * j as f64 + offset).clamp(MIN_VALUE, MAX_VALUE))
                    .collect()
            })
            .collect();

        Self {
            resolution,
            rpm_range: DEFAULT_RPM_RANGE,
            map_range: DEFAULT_MAP_RANGE,
            values,
            dyno_learned: false,
        }
    }

    /// Build a map with explicit axes, clamping every value into bounds
    pub fn with_axes(rpm_range: AxisRange, map_range: AxisRange, values: Vec<Vec<f64>>) -> Option<Self> {
        let raw = RawFuelMap {
            resolution: values.len(),
            rpm_range,
            map_range,
            values: values
                .into_iter()
                .map(|row| row.into_iter().map(|v| v.clamp(MIN_VALUE, MAX_VALUE)).collect())
                .collect(),
            dyno_learned: false,
        };
        FuelMap::try_from(raw).ok()
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn rpm_range(&self) -> AxisRange {
        self.rpm_range
    }

    pub fn map_range(&self) -> AxisRange {
        self.map_range
    }

    pub fn values(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn dyno_learned(&self) -> bool {
        self.dyno_learned
    }

    pub fn mark_dyno_learned(&mut self) {
        self.dyno_learned = true;
    }

    /// Whether `(rpm, map_value)` lies inside both configured axes
    pub fn in_range(&self, rpm: f64, map_value: f64) -> bool {
        self.rpm_range.contains(rpm) && self.map_range.contains(map_value)
    }

    /// Cell for a continuous operating point; always a valid index, inputs
    /// outside the axes land on the nearest edge cell
    pub fn lookup(&self, rpm: f64, map_value: f64) -> Cell {
        Cell {
            rpm: self.rpm_range.bin(rpm, self.resolution),
            map: self.map_range.bin(map_value, self.resolution),
        }
    }

    pub fn get(&self, cell: Cell) -> Option<f64> {
        self.values.get(cell.rpm).and_then(|row| row.get(cell.map)).copied()
    }

    /// Write a cell, clamping into bounds. Returns the stored value; NaN
    /// leaves the cell untouched.
    pub fn set(&mut self, cell: Cell, value: f64) -> Option<f64> {
        let slot = self.values.get_mut(cell.rpm)?.get_mut(cell.map)?;
        if value.is_nan() {
            return Some(*slot);
        }
        *slot = value.clamp(MIN_VALUE, MAX_VALUE);
        Some(*slot)
    }

    /// Largest absolute per-cell difference to `other`, if the grids match
    pub fn max_delta(&self, other: &FuelMap) -> Option<f64> {
        if self.resolution != other.resolution {
            return None;
        }
        self.values
            .iter()
            .flatten()
            .zip(other.values.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .fold(Some(0.0), |acc: Option<f64>, d| acc.map(|m| m.max(d)))
    }

    /// Resample onto a `resolution`×`resolution` grid over the same axes,
    /// bilinearly interpolating between old cell centres
    pub fn rebin(&self, resolution: usize) -> FuelMap {
        let resolution = resolution.max(1);
        let old_centres = cell_centres(self.resolution);
        let new_centres = cell_centres(resolution);

        let values = new_centres
            .iter()
            .map(|&r| {
                new_centres
                    .iter()
                    .map(|&m| interpolate(r, m, &old_centres, &self.values).clamp(MIN_VALUE, MAX_VALUE))
                    .collect()
            })
            .collect();

        FuelMap {
            resolution,
            rpm_range: self.rpm_range,
            map_range: self.map_range,
            values,
            dyno_learned: self.dyno_learned,
        }
    }
}

/// Normalised positions of cell centres along an axis
fn cell_centres(resolution: usize) -> Vec<f64> {
    (0..resolution)
        .map(|k| (k as f64 + 0.5) / resolution as f64)
        .collect()
}

fn interpolate(rpm: f64, map: f64, centres: &[f64], values: &[Vec<f64>]) -> f64 {
    let (r0, r1, tr) = surrounding(rpm, centres);
    let (m0, m1, tm) = surrounding(map, centres);

    let v00 = values[r0][m0];
    let v01 = values[r0][m1];
    let v10 = values[r1][m0];
    let v11 = values[r1][m1];

    let low = v00 + (v01 - v00) * tm;
    let high = v10 + (v11 - v10) * tm;
    low + (high - low) * tr
}

/// Indices bracketing `value` and the ratio between them, clamped to the edges
fn surrounding(value: f64, bins: &[f64]) -> (usize, usize, f64) {
    let last = bins.len() - 1;
    if value <= bins[0] {
        return (0, 0, 0.0);
    }
    if value >= bins[last] {
        return (last, last, 0.0);
    }

    for (i, pair) in bins.windows(2).enumerate() {
        if value >= pair[0] && value <= pair[1] {
            return (i, i + 1, (value - pair[0]) / (pair[1] - pair[0]));
        }
    }
    (last, last, 0.0)
}
