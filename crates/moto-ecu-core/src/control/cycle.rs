//! The control cycle
//!
//! One call to [`ControlLoop::run_cycle`] per tick:
//!
//! 1. evaluate node health (may fail a role over to the backup)
//! 2. sample the dyno request input and the supply
//! 3. read the freshest sensor sample from the active source
//! 4. per connected cylinder: learn and build the command (cold-start
//!    enrichment applied), then pace the last good command of every
//!    cylinder through the actuation scheduler, with or without a new sample
//! 5. persist dirty maps when the persistence cadence elapses
//! 6. check stage convergence when the stage cadence elapses
//! 7. shut down through the persistence flush if power is lost
//!
//! The cycle never waits on a node or on the disk.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::cadence::Cadence;
use super::dyno::DynoLatch;
use super::io::{DisplayStatus, HostIo};
use super::state::{ControlState, EcuContext, FuelMapSet};
use super::ControlError;
use crate::actuation::{ActuationError, ActuationScheduler, FireOutcome};
use crate::config::{ControlConfig, EcuConfig};
use crate::failover::FailoverCoordinator;
use crate::fuel_map::{FuelMapStore, Profile};
use crate::learning::{LearnOutcome, LearningEngine, STAGES};
use crate::persist::PersistHandle;
use crate::protocol::{ActuatorCommand, Role, SensorSample};

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShutdownReason {
    /// 12 V supply lost
    PowerLoss,
    LowBattery { voltage: f64 },
    /// Operator or process signal
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::PowerLoss => write!(f, "12V power lost"),
            ShutdownReason::LowBattery { voltage } => write!(f, "battery low ({voltage:.1}V)"),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
        }
    }
}

/// Result of one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    Continue,
    /// Maps have been flushed; the caller must stop ticking
    Shutdown(ShutdownReason),
}

/// Orchestrates learning, actuation, failover and persistence
pub struct ControlLoop<I: HostIo> {
    ctx: EcuContext,
    io: I,
    engine: LearningEngine,
    control: ControlConfig,
    store: FuelMapStore,
    persist: Option<PersistHandle>,
    persist_cadence: Cadence,
    stage_cadence: Cadence,
    dyno: DynoLatch,
    /// Monotonic time since start, fed to the actuation scheduler
    clock: Duration,
    last_good: BTreeMap<u8, ActuatorCommand>,
    /// Index into the connected cylinders where the next firing round starts
    next_first: usize,
    last_sample: Option<SensorSample>,
    battery_voltage: f64,
    stopped: Option<ShutdownReason>,
}

impl<I: HostIo> ControlLoop<I> {
    /// Detect actuators, validate wiring and load every fuel map
    pub fn new(config: &EcuConfig, failover: FailoverCoordinator, mut io: I) -> Result<Self, ControlError> {
        let pins = config.actuation.pins.clone();
        let connected = pins.detect_connected(config.cylinders, |pin| io.actuator_present(pin));
        if connected.is_empty() {
            return Err(ControlError::NoCylinders);
        }
        tracing::info!(cylinders = ?connected, "actuator outputs detected");

        let scheduler = ActuationScheduler::new(
            pins,
            &connected,
            config.actuation.slack(),
            config.control.cycle_period(),
        )?;

        let store = FuelMapStore::new(&config.data_dir);
        let mut maps = FuelMapSet::load(&store, &connected, STAGES[0].resolution);
        let mut state = ControlState::new(config.profile, connected);
        state.stage_index = maps.align_stage();
        tracing::info!(
            profile = %state.profile,
            stage = state.stage_index + 1,
            resolution = state.resolution(),
            dir = %store.dir().display(),
            "fuel maps loaded"
        );

        Ok(Self {
            ctx: EcuContext {
                state,
                maps,
                failover,
                scheduler,
            },
            io,
            engine: LearningEngine::new(config.learning.clone()),
            control: config.control.clone(),
            store,
            persist: None,
            persist_cadence: Cadence::new(config.control.persist_interval()),
            stage_cadence: Cadence::new(config.control.stage_check_interval()),
            dyno: DynoLatch::new(config.control.dyno_hold()),
            clock: Duration::ZERO,
            last_good: BTreeMap::new(),
            next_first: 0,
            last_sample: None,
            battery_voltage: 0.0,
            stopped: None,
        })
    }

    /// Hand cadence saves to a background worker instead of writing inline
    pub fn with_persistence(mut self, handle: PersistHandle) -> Self {
        self.persist = Some(handle);
        self
    }

    pub fn context(&self) -> &EcuContext {
        &self.ctx
    }

    pub fn state(&self) -> &ControlState {
        &self.ctx.state
    }

    pub fn maps(&self) -> &FuelMapSet {
        &self.ctx.maps
    }

    pub fn failover(&self) -> &FailoverCoordinator {
        &self.ctx.failover
    }

    pub fn store(&self) -> &FuelMapStore {
        &self.store
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    /// Last command dispatched (or re-dispatched) for `cylinder`
    pub fn last_command(&self, cylinder: u8) -> Option<ActuatorCommand> {
        self.last_good.get(&cylinder).copied()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn set_profile(&mut self, profile: Profile) {
        if self.ctx.state.profile == profile {
            return;
        }
        tracing::info!(from = %self.ctx.state.profile, to = %profile, "tuning profile changed");
        self.ctx.state.profile = profile;
        self.ctx.maps.reset_trackers();
    }

    pub fn clear_dyno_mode(&mut self) {
        if self.ctx.state.dyno_mode_active {
            tracing::info!("dyno mode cleared");
        }
        self.dyno.clear();
        self.ctx.state.dyno_mode_active = false;
    }

    /// Operator reset of a failed-over role back to its primary node
    pub fn reset_role(&mut self, role: Role) {
        self.ctx.failover.reset(role);
    }

    /// Run one control cycle, `dt` after the previous one
    pub fn run_cycle(&mut self, dt: Duration) -> CycleOutcome {
        if let Some(reason) = self.stopped {
            return CycleOutcome::Shutdown(reason);
        }
        self.clock += dt;

        self.ctx.failover.check_health();

        if self.dyno.advance(self.io.dyno_button_pressed(), dt) {
            tracing::info!("dyno mode active");
            self.ctx.state.dyno_mode_active = true;
        }
        self.battery_voltage = self.io.battery_voltage();
        let power_present = self.io.power_present();

        match self.ctx.failover.read_sensor() {
            Some(mut sample) => {
                if !self.ctx.state.dyno_mode_active {
                    sample.dyno = None;
                }
                self.last_sample = Some(sample);
                self.learn(&sample);
            }
            None => tracing::debug!("no fresh sensor sample, repeating last commands"),
        }
        self.fire_commands();

        self.collect_persist_failures();
        if self.persist_cadence.advance(dt) {
            self.persist_dirty();
        }
        if self.stage_cadence.advance(dt) {
            self.check_stage();
        }

        if !power_present {
            return self.shutdown(ShutdownReason::PowerLoss);
        }
        if let Some(min) = self.control.min_battery_voltage {
            if self.battery_voltage < min {
                return self.shutdown(ShutdownReason::LowBattery {
                    voltage: self.battery_voltage,
                });
            }
        }

        if !self.ctx.state.ready {
            self.ctx.state.ready = true;
            self.io.set_ready(true);
            tracing::info!("system ready");
        }

        let status = self.display_status();
        self.io.render(&status);
        CycleOutcome::Continue
    }

    /// Update every connected cylinder's map from `sample` and refresh its
    /// last-known-good command. Cylinders whose update is skipped keep the
    /// previous command.
    fn learn(&mut self, sample: &SensorSample) {
        let profile = self.ctx.state.profile;
        let target_afr = self.engine.settings().target_afr(profile);
        let cold = sample.engine_temp < self.control.cold_start_temp;

        for i in 0..self.ctx.state.connected_cylinders.len() {
            let cylinder = self.ctx.state.connected_cylinders[i];
            let Some(map) = self.ctx.maps.map_mut(profile, cylinder) else {
                continue;
            };

            let was_dyno_learned = map.dyno_learned();
            match self.engine.update(map, sample, target_afr, profile) {
                LearnOutcome::Applied { value, .. } => {
                    if !was_dyno_learned && map.dyno_learned() {
                        tracing::info!(profile = %profile, cylinder, "fuel map refined with dyno feedback");
                    }
                    self.ctx.maps.record_update(profile, cylinder);

                    let injector = if cold {
                        value * self.control.cold_start_factor
                    } else {
                        value
                    };
                    self.last_good.insert(
                        cylinder,
                        ActuatorCommand::new(cylinder, injector, self.control.ignition_pulse_ms),
                    );
                }
                LearnOutcome::Skipped(reason) => {
                    tracing::debug!(cylinder, ?reason, "learning skipped");
                }
            }
        }
    }

    /// Pace every cylinder's last-known-good command through the scheduler.
    ///
    /// The cycle starts from the cylinder deferred first in the previous
    /// cycle, so a saturated actuator node spreads deferrals round-robin
    /// instead of starving the highest cylinders.
    fn fire_commands(&mut self) {
        let count = self.ctx.state.connected_cylinders.len();
        if count == 0 {
            return;
        }
        let start = self.next_first % count;
        let mut first_deferred = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            let cylinder = self.ctx.state.connected_cylinders[index];
            let Some(command) = self.last_good.get(&cylinder).copied() else {
                continue;
            };

            match self
                .ctx
                .scheduler
                .fire(&mut self.ctx.failover, self.clock, &command)
            {
                Ok(FireOutcome::Sent { .. }) | Ok(FireOutcome::NoOp) => {}
                Ok(FireOutcome::Deferred { backlog }) => {
                    first_deferred.get_or_insert(index);
                    tracing::warn!(cylinder, backlog_us = backlog.as_micros() as u64, "actuation deferred");
                }
                Err(ActuationError::Link(e)) => {
                    tracing::warn!(cylinder, "actuator command not delivered: {e}");
                }
                Err(e) => {
                    tracing::warn!(cylinder, "actuator command rejected: {e}");
                }
            }
        }

        self.next_first = first_deferred.unwrap_or((start + 1) % count);
    }

    fn collect_persist_failures(&mut self) {
        if let Some(handle) = self.persist.as_mut() {
            for failure in handle.take_failures() {
                self.ctx.maps.mark_dirty(failure.profile, failure.cylinder);
            }
        }
    }

    /// Save (or queue) every map changed since the last save
    fn persist_dirty(&mut self) {
        for job in self.ctx.maps.take_dirty() {
            match &self.persist {
                Some(handle) => {
                    if let Err(job) = handle.submit(job) {
                        tracing::debug!(profile = %job.profile, cylinder = job.cylinder, "persistence queue full");
                        self.ctx.maps.mark_dirty(job.profile, job.cylinder);
                    }
                }
                None => {
                    if let Err(e) = self.store.save(&job.map, job.profile, job.cylinder) {
                        tracing::warn!(profile = %job.profile, cylinder = job.cylinder, "fuel map save failed: {e}");
                        self.ctx.maps.mark_dirty(job.profile, job.cylinder);
                    }
                }
            }
        }
    }

    fn check_stage(&mut self) {
        let index = self.ctx.state.stage_index;
        let Some(next) = STAGES.get(index + 1) else {
            return;
        };
        let threshold = STAGES[index].threshold;
        let profile = self.ctx.state.profile;

        if self
            .ctx
            .maps
            .converged(profile, &self.ctx.state.connected_cylinders, threshold)
        {
            self.ctx.maps.rebin_all(next.resolution);
            self.ctx.state.stage_index = index + 1;
            tracing::info!(
                stage = index + 2,
                resolution = next.resolution,
                "fuel maps converged, advancing stage"
            );
        }
    }

    pub fn display_status(&self) -> DisplayStatus {
        let sample = self.last_sample.unwrap_or(SensorSample {
            rpm: 0.0,
            map: 0.0,
            afr: 0.0,
            engine_temp: 0.0,
            dyno: None,
        });
        let state = &self.ctx.state;
        DisplayStatus {
            rpm: sample.rpm,
            profile: state.profile,
            stage: state.stage_index + 1,
            afr: sample.afr,
            engine_temp: sample.engine_temp,
            battery_voltage: self.battery_voltage,
            dyno_mode: state.dyno_mode_active,
            dyno_learned: self.ctx.maps.dyno_learned(state.profile),
            sensor: self.ctx.failover.state(Role::Sensor),
            actuator: self.ctx.failover.state(Role::Actuator),
            backup: self.ctx.failover.backup_health(),
        }
    }

    /// Write every map synchronously and stop. Later cycles return the same
    /// outcome without doing anything.
    pub fn shutdown(&mut self, reason: ShutdownReason) -> CycleOutcome {
        if let Some(reason) = self.stopped {
            return CycleOutcome::Shutdown(reason);
        }
        match reason {
            ShutdownReason::Requested => tracing::info!("{reason}, saving fuel maps"),
            _ => tracing::error!("{reason}, saving fuel maps"),
        }

        if let Some(handle) = &self.persist {
            handle.close();
        }

        let mut failed = 0;
        for job in self.ctx.maps.take_all() {
            if let Err(e) = self.store.save(&job.map, job.profile, job.cylinder) {
                failed += 1;
                tracing::error!(profile = %job.profile, cylinder = job.cylinder, "final save failed: {e}");
            }
        }
        if failed == 0 {
            tracing::info!(maps = self.ctx.maps.len(), "fuel maps saved");
        }

        self.io.set_ready(false);
        self.ctx.state.ready = false;
        self.stopped = Some(reason);
        CycleOutcome::Shutdown(reason)
    }
}

impl<I: HostIo> fmt::Debug for ControlLoop<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlLoop")
            .field("state", &self.ctx.state)
            .field("clock", &self.clock)
            .field("stopped", &self.stopped)
            .finish()
    }
}
