//! Adaptive fuel learning
//!
//! Converts measured AFR error into fuel map corrections. Features:
//! - Single-step proportional correction of the cell under the operating point
//! - Profile-dependent dyno bonus when dynamometer feedback is present
//! - Out-of-range operating points are skipped, never aliased to an edge cell
//! - Staged resolution refinement driven by per-map convergence
//!
//! There is no filtering: one noisy sample moves the cell by `kp * error`.
//! Persistence is rate-limited by the control loop instead.

use serde::{Deserialize, Serialize};

use crate::fuel_map::{Cell, FuelMap, Profile};
use crate::protocol::SensorSample;

/// One resolution-refinement stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
    /// Grid is `resolution` × `resolution`
    pub resolution: usize,
    /// Largest per-cell change between checks for a map to count as converged
    pub threshold: f64,
}

/// Refinement stages, coarse to fine
pub const STAGES: [Stage; 3] = [
    Stage {
        resolution: 15,
        threshold: 0.1,
    },
    Stage {
        resolution: 20,
        threshold: 0.1,
    },
    Stage {
        resolution: 25,
        threshold: 0.1,
    },
];

/// Stage whose resolution matches `resolution`, falling back to the first
pub fn stage_index_for_resolution(resolution: usize) -> usize {
    STAGES
        .iter()
        .position(|s| s.resolution == resolution)
        .unwrap_or(0)
}

/// Gains and AFR targets for the learning rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSettings {
    /// Proportional gain applied to AFR error
    pub kp: f64,
    /// Gain applied to the dyno bonus term
    pub dyno_gain: f64,
    pub target_afr_efficiency: f64,
    pub target_afr_performance: f64,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            kp: 0.01,
            dyno_gain: 0.01,
            target_afr_efficiency: 14.7,
            target_afr_performance: 12.5,
        }
    }
}

impl LearningSettings {
    pub fn target_afr(&self, profile: Profile) -> f64 {
        match profile {
            Profile::Efficiency => self.target_afr_efficiency,
            Profile::Performance => self.target_afr_performance,
        }
    }
}

/// Why an update was not applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// Operating point lies outside the map's axes
    OutOfRange { rpm: f64, map: f64 },
}

/// Result of one learning step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearnOutcome {
    Applied {
        cell: Cell,
        previous: f64,
        value: f64,
        dyno_bonus: bool,
    },
    Skipped(SkipReason),
}

impl LearnOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, LearnOutcome::Applied { .. })
    }
}

/// Proportional per-cell learning rule
#[derive(Debug, Clone, Default)]
pub struct LearningEngine {
    settings: LearningSettings,
}

impl LearningEngine {
    pub fn new(settings: LearningSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LearningSettings {
        &self.settings
    }

    /// Apply one sample to `map`
    pub fn update(
        &self,
        map: &mut FuelMap,
        sample: &SensorSample,
        target_afr: f64,
        profile: Profile,
    ) -> LearnOutcome {
        if !map.in_range(sample.rpm, sample.map) {
            return LearnOutcome::Skipped(SkipReason::OutOfRange {
                rpm: sample.rpm,
                map: sample.map,
            });
        }

        let cell = map.lookup(sample.rpm, sample.map);
        let previous = map.get(cell).unwrap_or_default();

        let error = target_afr - sample.afr;
        let mut value = previous + self.settings.kp * error;

        let dyno_bonus = match sample.dyno {
            Some(dyno) => {
                value += match profile {
                    Profile::Performance => self.settings.dyno_gain * (dyno.hp + dyno.torque),
                    Profile::Efficiency => self.settings.dyno_gain * (dyno.torque - sample.afr),
                };
                map.mark_dyno_learned();
                true
            }
            None => false,
        };

        let value = map.set(cell, value).unwrap_or(previous);
        LearnOutcome::Applied {
            cell,
            previous,
            value,
            dyno_bonus,
        }
    }
}

/// Tracks how much a map moves between stage checks
#[derive(Debug, Clone, Default)]
pub struct ConvergenceTracker {
    baseline: Option<FuelMap>,
    updates: u32,
}

impl ConvergenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an applied learning update in the current window
    pub fn record_update(&mut self) {
        self.updates = self.updates.saturating_add(1);
    }

    pub fn updates(&self) -> u32 {
        self.updates
    }

    /// Close the current window. The map has converged when it received at
    /// least one update and no cell moved by `threshold` or more since the
    /// previous check.
    pub fn check(&mut self, map: &FuelMap, threshold: f64) -> bool {
        let converged = match &self.baseline {
            Some(baseline) if self.updates > 0 => map
                .max_delta(baseline)
                .map(|delta| delta < threshold)
                .unwrap_or(false),
            _ => false,
        };

        self.baseline = Some(map.clone());
        self.updates = 0;
        converged
    }

    /// Forget the baseline, e.g. after the map was re-binned
    pub fn reset(&mut self) {
        self.baseline = None;
        self.updates = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DynoData;

    fn sample(rpm: f64, map: f64, afr: f64) -> SensorSample {
        SensorSample {
            rpm,
            map,
            afr,
            engine_temp: 80.0,
            dyno: None,
        }
    }

    #[test]
    fn lean_mixture_raises_cell() {
        let engine = LearningEngine::default();
        let mut map = FuelMap::seeded(1, 15);
        let before = map.get(map.lookup(3000.0, 60.0)).unwrap();

        let outcome = engine.update(&mut map, &sample(3000.0, 60.0, 13.5), 14.7, Profile::Efficiency);

        let after = map.get(map.lookup(3000.0, 60.0)).unwrap();
        assert!(outcome.is_applied());
        assert!((after - before - 0.012).abs() < 1e-9);
    }

    #[test]
    fn huge_error_is_clamped() {
        let engine = LearningEngine::new(LearningSettings {
            kp: 1000.0,
            ..LearningSettings::default()
        });
        let mut map = FuelMap::seeded(1, 15);

        engine.update(&mut map, &sample(3000.0, 60.0, 6.0), 14.7, Profile::Efficiency);
        assert_eq!(map.get(map.lookup(3000.0, 60.0)), Some(crate::fuel_map::MAX_VALUE));

        engine.update(&mut map, &sample(3000.0, 60.0, 25.0), 14.7, Profile::Efficiency);
        assert_eq!(map.get(map.lookup(3000.0, 60.0)), Some(crate::fuel_map::MIN_VALUE));
    }

    #[test]
    fn performance_dyno_bonus_rewards_power_and_torque() {
        let engine = LearningEngine::default();
        let mut map = FuelMap::seeded(1, 15);
        let mut s = sample(3000.0, 60.0, 12.5);
        s.dyno = Some(DynoData {
            hp: 30.0,
            torque: 20.0,
        });

        let outcome = engine.update(&mut map, &s, 12.5, Profile::Performance);
        match outcome {
            LearnOutcome::Applied {
                previous,
                value,
                dyno_bonus,
                ..
            } => {
                assert!(dyno_bonus);
                assert!((value - previous - 0.5).abs() < 1e-9);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(map.dyno_learned());
    }

    #[test]
    fn efficiency_dyno_bonus_penalises_afr() {
        let engine = LearningEngine::default();
        let mut map = FuelMap::seeded(1, 15);
        let mut s = sample(3000.0, 60.0, 14.7);
        s.dyno = Some(DynoData {
            hp: 30.0,
            torque: 10.0,
        });

        let before = map.get(map.lookup(3000.0, 60.0)).unwrap();
        engine.update(&mut map, &s, 14.7, Profile::Efficiency);
        let after = map.get(map.lookup(3000.0, 60.0)).unwrap();

        // 0.01 * (10.0 - 14.7)
        assert!((after - before + 0.047).abs() < 1e-9);
    }

    #[test]
    fn tracker_needs_updates_and_small_deltas() {
        let mut tracker = ConvergenceTracker::new();
        let mut map = FuelMap::seeded(1, 15);

        // first check only establishes the baseline
        assert!(!tracker.check(&map, 0.1));
        // no updates in the window
        assert!(!tracker.check(&map, 0.1));

        let cell = Cell { rpm: 3, map: 3 };
        let v = map.get(cell).unwrap();
        map.set(cell, v + 0.05);
        tracker.record_update();
        assert!(tracker.check(&map, 0.1));

        map.set(cell, v + 0.5);
        tracker.record_update();
        assert!(!tracker.check(&map, 0.1));
    }

    #[test]
    fn stage_lookup_by_resolution() {
        assert_eq!(stage_index_for_resolution(20), 1);
        assert_eq!(stage_index_for_resolution(7), 0);
    }
}
