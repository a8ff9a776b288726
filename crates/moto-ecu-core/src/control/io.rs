//! Host-side collaborators polled by the control loop

use serde::Serialize;
use std::fmt;

use crate::failover::{NodeHealth, RoleState};
use crate::fuel_map::Profile;

/// Snapshot handed to the display once per cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayStatus {
    pub rpm: f64,
    pub profile: Profile,
    /// 1-based refinement stage
    pub stage: usize,
    pub afr: f64,
    pub engine_temp: f64,
    pub battery_voltage: f64,
    pub dyno_mode: bool,
    pub dyno_learned: bool,
    pub sensor: RoleState,
    pub actuator: RoleState,
    pub backup: NodeHealth,
}

impl DisplayStatus {
    /// Stage line as shown on the panel, e.g. `2 (DM)`
    pub fn stage_label(&self) -> String {
        if self.dyno_learned {
            format!("{} (DM)", self.stage)
        } else {
            self.stage.to_string()
        }
    }
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rpm={:.0} mode={} stage={} afr={:.2} temp={:.1}C battery={:.1}V",
            self.rpm,
            self.profile,
            self.stage_label(),
            self.afr,
            self.engine_temp,
            self.battery_voltage
        )?;
        if self.dyno_mode {
            write!(f, " DYNO")?;
        }
        if self.sensor != RoleState::Primary || self.actuator != RoleState::Primary {
            write!(f, " sensor={} actuator={}", self.sensor, self.actuator)?;
        }
        Ok(())
    }
}

/// Display, GPIO and supply inputs consumed by the control loop
pub trait HostIo {
    fn battery_voltage(&mut self) -> f64;

    /// Dyno-mode request input, sampled once per cycle
    fn dyno_button_pressed(&mut self) -> bool;

    /// 12 V supply present
    fn power_present(&mut self) -> bool;

    fn render(&mut self, status: &DisplayStatus);

    /// Ready indicator (green LED)
    fn set_ready(&mut self, ready: bool);

    /// Probe one actuator output during startup detection
    fn actuator_present(&mut self, _pin: u8) -> bool {
        true
    }
}
