//! Demo Mode - simulated nodes for bench running without hardware
//!
//! Wires three in-memory links to simulated sensor, actuator and backup nodes.
//! The sensor node reports an engine idling at ~1200 RPM with random throttle
//! blips while it warms up from a cold start. The backup node answers takeover
//! and release directives exactly like the real one, so failover can be
//! exercised by silencing the sensor node.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::failover::FailoverCoordinator;
use crate::protocol::{
    ActuatorCommand, Directive, DynoData, Link, MemoryLink, Role, SensorLimits, SensorSample,
};

const IDLE_RPM: f64 = 1200.0;
const RAMP_UP_MS: u64 = 300;
const HOLD_MS: u64 = 1500;
const RAMP_DOWN_MS: u64 = 800;

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlipState {
    Idle,
    RampUp { start_ms: u64 },
    Hold { start_ms: u64 },
    RampDown { start_ms: u64 },
}

/// Single-cylinder engine model producing correlated sensor readings
#[derive(Debug)]
pub struct EngineSim {
    sim_ms: u64,
    next_blip_at_ms: u64,
    blip_state: BlipState,
    blip_target_rpm: f64,
    current_rpm: f64,
    start_temp: f64,
    rng: StdRng,
}

impl EngineSim {
    pub fn new(mut rng: StdRng) -> Self {
        let next_blip_at_ms = rng.gen_range(2000..5000);
        Self {
            sim_ms: 0,
            next_blip_at_ms,
            blip_state: BlipState::Idle,
            blip_target_rpm: IDLE_RPM,
            current_rpm: IDLE_RPM,
            start_temp: 12.0,
            rng,
        }
    }

    /// Advance by `dt` and produce the sample a sensor node would report
    pub fn update(&mut self, dt: Duration, dyno: bool) -> SensorSample {
        let delta_ms = dt.as_millis() as u64;
        self.sim_ms += delta_ms;
        self.update_blip_state();

        let target_rpm = self.target_rpm();
        let rate = if target_rpm > self.current_rpm { 8000.0 } else { 3000.0 };
        let max_change = rate * (delta_ms as f64 / 1000.0);
        self.current_rpm += (target_rpm - self.current_rpm).clamp(-max_change, max_change);

        let t = self.sim_ms as f64 / 1000.0;
        let wobble = if self.blip_state == BlipState::Idle {
            20.0 * (t * 2.5).sin() + 10.0 * (t * 7.3).sin()
        } else {
            0.0
        };
        let rpm = (self.current_rpm + wobble).max(0.0);

        let load = ((rpm - IDLE_RPM) / (6000.0 - IDLE_RPM)).clamp(0.0, 1.0);
        let map = 30.0 + 60.0 * load + self.rng.gen_range(-1.0..1.0);
        // runs slightly lean under load until the maps catch up
        let afr = 14.2 + 0.8 * load + 0.3 * (t * 1.5).sin() + self.rng.gen_range(-0.1..0.1);
        let engine_temp = self.start_temp + (90.0 - self.start_temp) * (1.0 - (-t / 120.0).exp());

        SensorSample {
            rpm,
            map,
            afr,
            engine_temp,
            dyno: dyno.then(|| DynoData {
                hp: 45.0 * load + self.rng.gen_range(0.0..0.5),
                torque: 20.0 + 25.0 * load,
            }),
        }
    }

    fn update_blip_state(&mut self) {
        let now = self.sim_ms;
        match self.blip_state {
            BlipState::Idle => {
                if now >= self.next_blip_at_ms {
                    self.blip_target_rpm = self.rng.gen_range(3000.0..6000.0);
                    self.blip_state = BlipState::RampUp { start_ms: now };
                }
            }
            BlipState::RampUp { start_ms } => {
                if now >= start_ms + RAMP_UP_MS {
                    self.blip_state = BlipState::Hold { start_ms: now };
                }
            }
            BlipState::Hold { start_ms } => {
                if now >= start_ms + HOLD_MS {
                    self.blip_state = BlipState::RampDown { start_ms: now };
                }
            }
            BlipState::RampDown { start_ms } => {
                if now >= start_ms + RAMP_DOWN_MS {
                    self.blip_state = BlipState::Idle;
                    self.next_blip_at_ms = now + self.rng.gen_range(3000..8000);
                }
            }
        }
    }

    fn target_rpm(&self) -> f64 {
        match self.blip_state {
            BlipState::Idle => IDLE_RPM,
            BlipState::RampUp { start_ms } => {
                let progress = ((self.sim_ms - start_ms) as f64 / RAMP_UP_MS as f64).min(1.0);
                IDLE_RPM + (self.blip_target_rpm - IDLE_RPM) * progress
            }
            BlipState::Hold { .. } => self.blip_target_rpm,
            BlipState::RampDown { start_ms } => {
                let progress = ((self.sim_ms - start_ms) as f64 / RAMP_DOWN_MS as f64).min(1.0);
                self.blip_target_rpm + (IDLE_RPM - self.blip_target_rpm) * progress
            }
        }
    }
}

/// Actuator-side bookkeeping shared by the actuator and backup nodes
#[derive(Debug, Default)]
struct CommandLog {
    fired: u64,
    rejected: u64,
    last: BTreeMap<u8, ActuatorCommand>,
}

impl CommandLog {
    fn accept(&mut self, line: &str) {
        match ActuatorCommand::decode(line) {
            Ok(command) => {
                self.fired += 1;
                self.last.insert(command.cylinder, command);
            }
            Err(_) => self.rejected += 1,
        }
    }
}

/// Host ends of the three bench links
#[derive(Clone)]
pub struct HostLinks {
    pub sensor: MemoryLink,
    pub actuator: MemoryLink,
    pub backup: MemoryLink,
}

/// Simulated node set
pub struct DemoBench {
    host: HostLinks,
    sensor_node: MemoryLink,
    actuator_node: MemoryLink,
    backup_node: MemoryLink,
    engine: EngineSim,
    elapsed: Duration,
    sensor_silent_after: Option<Duration>,
    dyno: bool,
    actuator_log: CommandLog,
    backup_log: CommandLog,
    backup_sensor: bool,
    backup_actuator: bool,
}

impl Default for DemoBench {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoBench {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Reproducible bench
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let (sensor, sensor_node) = MemoryLink::pair("sensor", "sensor-node");
        let (actuator, actuator_node) = MemoryLink::pair("actuator", "actuator-node");
        let (backup, backup_node) = MemoryLink::pair("backup", "backup-node");

        Self {
            host: HostLinks {
                sensor,
                actuator,
                backup,
            },
            sensor_node,
            actuator_node,
            backup_node,
            engine: EngineSim::new(rng),
            elapsed: Duration::ZERO,
            sensor_silent_after: None,
            dyno: false,
            actuator_log: CommandLog::default(),
            backup_log: CommandLog::default(),
            backup_sensor: false,
            backup_actuator: false,
        }
    }

    /// Sensor node stops reporting once the bench has run for `at`
    pub fn silence_sensor_after(&mut self, at: Duration) {
        self.sensor_silent_after = Some(at);
    }

    /// Attach dynamometer readings to every sensor frame
    pub fn set_dyno(&mut self, enabled: bool) {
        self.dyno = enabled;
    }

    pub fn host_links(&self) -> HostLinks {
        self.host.clone()
    }

    /// Failover coordinator wired to the bench links
    pub fn coordinator(&self, limits: SensorLimits, miss_threshold: u32) -> FailoverCoordinator {
        let links = self.host_links();
        FailoverCoordinator::new(
            Box::new(links.sensor),
            Box::new(links.actuator),
            Box::new(links.backup),
            limits,
            miss_threshold,
        )
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn sensor_silent(&self) -> bool {
        self.sensor_silent_after
            .map(|at| self.elapsed >= at)
            .unwrap_or(false)
    }

    /// Supply voltage with a little alternator ripple
    pub fn battery_voltage(&self) -> f64 {
        13.8 + 0.2 * (self.elapsed.as_secs_f64() * 0.5).sin()
    }

    /// Commands executed by the actuator and backup nodes together
    pub fn commands_fired(&self) -> u64 {
        self.actuator_log.fired + self.backup_log.fired
    }

    pub fn backup_fired(&self) -> u64 {
        self.backup_log.fired
    }

    /// Last command the primary actuator node executed for `cylinder`
    pub fn last_command(&self, cylinder: u8) -> Option<ActuatorCommand> {
        self.actuator_log.last.get(&cylinder).copied()
    }

    pub fn backup_serving(&self, role: Role) -> bool {
        match role {
            Role::Sensor => self.backup_sensor,
            Role::Actuator => self.backup_actuator,
        }
    }

    /// Advance every node by `dt`: consume what the host sent, then emit
    /// this period's sensor frame
    pub fn step(&mut self, dt: Duration) {
        self.elapsed += dt;

        while let Ok(Some(line)) = self.actuator_node.try_recv_line() {
            self.actuator_log.accept(&line);
        }

        while let Ok(Some(line)) = self.backup_node.try_recv_line() {
            match Directive::parse(&line) {
                Some(directive) => self.apply_directive(directive),
                None if self.backup_actuator => self.backup_log.accept(&line),
                None => self.backup_log.rejected += 1,
            }
        }

        let sample = self.engine.update(dt, self.dyno);
        let frame = sample.encode();
        if !self.sensor_silent() {
            let _ = self.sensor_node.send_line(&frame);
        }
        if self.backup_sensor {
            let _ = self.backup_node.send_line(&frame);
        }
    }

    fn apply_directive(&mut self, directive: Directive) {
        tracing::debug!(directive = directive.as_str(), "backup node received directive");
        match directive {
            Directive::TakeOver(Role::Sensor) => self.backup_sensor = true,
            Directive::TakeOver(Role::Actuator) => self.backup_actuator = true,
            Directive::Release(Role::Sensor) => self.backup_sensor = false,
            Directive::Release(Role::Actuator) => self.backup_actuator = false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuation::ActuatorSink;
    use crate::failover::RoleState;

    const TICK: Duration = Duration::from_millis(50);

    #[test]
    fn idle_frames_are_valid() {
        let mut sim = EngineSim::new(StdRng::seed_from_u64(7));
        let limits = SensorLimits::default();
        for _ in 0..30 {
            let sample = sim.update(TICK, false);
            let decoded = SensorSample::decode(&sample.encode(), &limits).unwrap();
            assert!(decoded.rpm > 1000.0 && decoded.rpm < 1400.0, "rpm {}", decoded.rpm);
            assert!(decoded.dyno.is_none());
        }
    }

    #[test]
    fn engine_warms_up() {
        let mut sim = EngineSim::new(StdRng::seed_from_u64(1));
        let cold = sim.update(TICK, false).engine_temp;
        let warm = sim.update(Duration::from_secs(60), false).engine_temp;
        assert!(cold < 20.0);
        assert!(warm > cold && warm < 90.0);
    }

    #[test]
    fn backup_takes_over_silent_sensor() {
        let mut bench = DemoBench::with_seed(3);
        bench.silence_sensor_after(Duration::from_millis(200));
        let mut coordinator = bench.coordinator(SensorLimits::default(), 3);

        let mut from_backup = 0;
        for _ in 0..20 {
            bench.step(TICK);
            coordinator.check_health();
            if coordinator.read_sensor().is_some()
                && coordinator.state(Role::Sensor) == RoleState::BackupActive
            {
                from_backup += 1;
            }
        }

        assert!(bench.backup_serving(Role::Sensor));
        assert!(from_backup > 0);
    }

    #[test]
    fn actuator_node_executes_dispatched_commands() {
        let mut bench = DemoBench::with_seed(5);
        let mut coordinator = bench.coordinator(SensorLimits::default(), 3);

        let command = ActuatorCommand::new(2, 4.0, 10.0);
        coordinator.dispatch(&command).unwrap();
        bench.step(TICK);

        assert_eq!(bench.last_command(2), Some(command));
        assert_eq!(bench.last_command(1), None);
        assert_eq!(bench.commands_fired(), 1);
        assert_eq!(bench.backup_fired(), 0);
    }
}
