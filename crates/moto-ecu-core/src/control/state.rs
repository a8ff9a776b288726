//! Explicit ECU context passed through the control cycle

use std::collections::BTreeMap;

use crate::actuation::ActuationScheduler;
use crate::failover::FailoverCoordinator;
use crate::fuel_map::{FuelMap, FuelMapStore, Profile};
use crate::learning::{stage_index_for_resolution, ConvergenceTracker, STAGES};
use crate::persist::PersistJob;

/// Process-wide operating state, mutated only by the control loop
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub profile: Profile,
    /// Index into [`STAGES`]
    pub stage_index: usize,
    pub dyno_mode_active: bool,
    /// Cylinders with working actuator outputs, found at startup
    pub connected_cylinders: Vec<u8>,
    /// Ready indicator has been raised
    pub ready: bool,
}

impl ControlState {
    pub fn new(profile: Profile, connected_cylinders: Vec<u8>) -> Self {
        Self {
            profile,
            stage_index: 0,
            dyno_mode_active: false,
            connected_cylinders,
            ready: false,
        }
    }

    /// Grid resolution of the current stage
    pub fn resolution(&self) -> usize {
        STAGES[self.stage_index.min(STAGES.len() - 1)].resolution
    }
}

#[derive(Debug)]
struct MapSlot {
    map: FuelMap,
    dirty: bool,
    tracker: ConvergenceTracker,
}

impl MapSlot {
    fn new(map: FuelMap) -> Self {
        Self {
            map,
            dirty: false,
            tracker: ConvergenceTracker::new(),
        }
    }
}

/// Every in-memory fuel map, keyed by (profile, cylinder), with dirty flags
/// and convergence tracking
#[derive(Debug, Default)]
pub struct FuelMapSet {
    slots: BTreeMap<(Profile, u8), MapSlot>,
}

impl FuelMapSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or seed) maps for both profiles of every cylinder
    pub fn load(store: &FuelMapStore, cylinders: &[u8], resolution: usize) -> Self {
        let mut set = Self::new();
        for profile in Profile::ALL {
            for &cylinder in cylinders {
                set.insert(profile, cylinder, store.load_or_create(profile, cylinder, resolution));
            }
        }
        set
    }

    pub fn insert(&mut self, profile: Profile, cylinder: u8, map: FuelMap) {
        self.slots.insert((profile, cylinder), MapSlot::new(map));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, profile: Profile, cylinder: u8) -> Option<&FuelMap> {
        self.slots.get(&(profile, cylinder)).map(|slot| &slot.map)
    }

    /// Mutable access for the learning step; pair with [`FuelMapSet::record_update`]
    pub fn map_mut(&mut self, profile: Profile, cylinder: u8) -> Option<&mut FuelMap> {
        self.slots.get_mut(&(profile, cylinder)).map(|slot| &mut slot.map)
    }

    /// Note an applied learning update: the map needs saving and counts
    /// towards convergence
    pub fn record_update(&mut self, profile: Profile, cylinder: u8) {
        if let Some(slot) = self.slots.get_mut(&(profile, cylinder)) {
            slot.dirty = true;
            slot.tracker.record_update();
        }
    }

    pub fn mark_dirty(&mut self, profile: Profile, cylinder: u8) {
        if let Some(slot) = self.slots.get_mut(&(profile, cylinder)) {
            slot.dirty = true;
        }
    }

    pub fn is_dirty(&self, profile: Profile, cylinder: u8) -> bool {
        self.slots
            .get(&(profile, cylinder))
            .map(|slot| slot.dirty)
            .unwrap_or(false)
    }

    /// Snapshots of every dirty map; flags are cleared
    pub fn take_dirty(&mut self) -> Vec<PersistJob> {
        self.slots
            .iter_mut()
            .filter(|(_, slot)| slot.dirty)
            .map(|(&(profile, cylinder), slot)| {
                slot.dirty = false;
                PersistJob {
                    profile,
                    cylinder,
                    map: slot.map.clone(),
                }
            })
            .collect()
    }

    /// Snapshots of every map, dirty or not; flags are cleared
    pub fn take_all(&mut self) -> Vec<PersistJob> {
        for slot in self.slots.values_mut() {
            slot.dirty = true;
        }
        self.take_dirty()
    }

    /// Any map of `profile` refined with dyno feedback
    pub fn dyno_learned(&self, profile: Profile) -> bool {
        self.slots
            .iter()
            .any(|(&(p, _), slot)| p == profile && slot.map.dyno_learned())
    }

    /// Bring every map onto one stage resolution. The stage is the coarsest
    /// one found among the loaded maps; unknown resolutions count as stage 0.
    pub fn align_stage(&mut self) -> usize {
        let index = self
            .slots
            .values()
            .map(|slot| stage_index_for_resolution(slot.map.resolution()))
            .min()
            .unwrap_or(0);
        self.rebin_all(STAGES[index].resolution);
        index
    }

    /// Re-bin every map whose grid differs from `resolution`
    pub fn rebin_all(&mut self, resolution: usize) {
        for (&(profile, cylinder), slot) in self.slots.iter_mut() {
            if slot.map.resolution() != resolution {
                tracing::debug!(
                    profile = %profile,
                    cylinder,
                    from = slot.map.resolution(),
                    to = resolution,
                    "re-binning fuel map"
                );
                slot.map = slot.map.rebin(resolution);
                slot.dirty = true;
                slot.tracker.reset();
            }
        }
    }

    /// Close the convergence window for `profile`. True when every listed
    /// cylinder's map saw updates and moved less than `threshold`.
    pub fn converged(&mut self, profile: Profile, cylinders: &[u8], threshold: f64) -> bool {
        let mut all = !cylinders.is_empty();
        for &cylinder in cylinders {
            match self.slots.get_mut(&(profile, cylinder)) {
                // every tracker must see the check so its window restarts
                Some(slot) => all &= slot.tracker.check(&slot.map, threshold),
                None => all = false,
            }
        }
        all
    }

    pub fn reset_trackers(&mut self) {
        for slot in self.slots.values_mut() {
            slot.tracker.reset();
        }
    }
}

/// All mutable ECU state for one engine
pub struct EcuContext {
    pub state: ControlState,
    pub maps: FuelMapSet,
    pub failover: FailoverCoordinator,
    pub scheduler: ActuationScheduler,
}
