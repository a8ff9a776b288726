//! Console stand-in for the dashboard display and GPIO inputs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use moto_ecu_core::control::{DisplayStatus, HostIo};

/// Logs the display once per `render_every` cycles; supply state is a shared
/// flag so operator commands can pull the power
pub struct ConsoleIo {
    power: Arc<AtomicBool>,
    battery_voltage: f64,
    dyno_request: bool,
    render_every: u32,
    cycles: u32,
}

impl ConsoleIo {
    pub fn new(battery_voltage: f64, render_every: u32) -> Self {
        Self {
            power: Arc::new(AtomicBool::new(true)),
            battery_voltage,
            dyno_request: false,
            render_every: render_every.max(1),
            cycles: 0,
        }
    }

    /// Flag read as "12 V present"; store `false` to trigger the power-loss path
    pub fn power_flag(&self) -> Arc<AtomicBool> {
        self.power.clone()
    }

    pub fn set_battery_voltage(&mut self, voltage: f64) {
        self.battery_voltage = voltage;
    }

    /// Hold the dyno request input for the whole run
    pub fn hold_dyno_request(&mut self, held: bool) {
        self.dyno_request = held;
    }
}

impl HostIo for ConsoleIo {
    fn battery_voltage(&mut self) -> f64 {
        self.battery_voltage
    }

    fn dyno_button_pressed(&mut self) -> bool {
        self.dyno_request
    }

    fn power_present(&mut self) -> bool {
        self.power.load(Ordering::SeqCst)
    }

    fn render(&mut self, status: &DisplayStatus) {
        if self.cycles % self.render_every == 0 {
            tracing::info!("{status}");
        }
        self.cycles = self.cycles.wrapping_add(1);
    }

    fn set_ready(&mut self, ready: bool) {
        if ready {
            tracing::info!("ready indicator on");
        } else {
            tracing::info!("ready indicator off");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_flag_is_shared() {
        let mut io = ConsoleIo::new(12.6, 20);
        assert!(io.power_present());
        io.power_flag().store(false, Ordering::SeqCst);
        assert!(!io.power_present());
    }

    #[test]
    fn zero_render_interval_is_clamped() {
        let io = ConsoleIo::new(12.6, 0);
        assert_eq!(io.render_every, 1);
    }
}
