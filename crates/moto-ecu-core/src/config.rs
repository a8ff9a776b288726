//! ECU configuration stored in a JSON file
//!
//! Every section falls back to its defaults, so a partial file (or `{}`) is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::actuation::PinMap;
use crate::fuel_map::Profile;
use crate::learning::LearningSettings;
use crate::protocol::{SensorLimits, DEFAULT_BAUD_RATE, DEFAULT_WRITE_TIMEOUT_MS, MAX_CYLINDERS};

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Serial devices of the three nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub sensor: String,
    pub actuator: String,
    pub backup: String,
    pub baud_rate: u32,
    /// Budget for one outbound frame before the write counts as a timeout
    pub write_timeout_ms: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            sensor: "/dev/ttyUSB0".to_string(),
            actuator: "/dev/ttyUSB1".to_string(),
            backup: "/dev/ttyUSB2".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
        }
    }
}

impl PortsConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Control cycle timing and enrichment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub cycle_period_ms: u64,
    pub persist_interval_ms: u64,
    pub stage_check_interval_ms: u64,
    /// Below this engine temperature (°C) the injector pulse is enriched
    pub cold_start_temp: f64,
    pub cold_start_factor: f64,
    /// Ignition pulse sent with every command (ms)
    pub ignition_pulse_ms: f64,
    /// How long the dyno request input must be held to latch dyno mode
    pub dyno_hold_ms: u64,
    /// Shut down when battery voltage falls below this, if set
    pub min_battery_voltage: Option<f64>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: 50,
            persist_interval_ms: 10_000,
            stage_check_interval_ms: 5_000,
            cold_start_temp: 20.0,
            cold_start_factor: 1.2,
            ignition_pulse_ms: 10.0,
            dyno_hold_ms: 10_000,
            min_battery_voltage: None,
        }
    }
}

impl ControlConfig {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn stage_check_interval(&self) -> Duration {
        Duration::from_millis(self.stage_check_interval_ms)
    }

    pub fn dyno_hold(&self) -> Duration {
        Duration::from_millis(self.dyno_hold_ms)
    }
}

/// Liveness policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Consecutive missed cycles before a node is declared failed
    pub miss_threshold: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self { miss_threshold: 3 }
    }
}

/// Actuator node wiring and pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuationConfig {
    pub pins: PinMap,
    /// Gap left after each command for UART transfer and line settling (µs)
    pub slack_us: u64,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            pins: PinMap::default(),
            slack_us: 200,
        }
    }
}

impl ActuationConfig {
    pub fn slack(&self) -> Duration {
        Duration::from_micros(self.slack_us)
    }
}

/// Complete ECU configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcuConfig {
    pub ports: PortsConfig,
    /// Directory holding the persisted fuel maps
    pub data_dir: PathBuf,
    /// Profile selected at startup
    pub profile: Profile,
    /// Highest cylinder number probed during actuator detection
    pub cylinders: u8,
    pub control: ControlConfig,
    pub learning: LearningSettings,
    pub failover: FailoverConfig,
    pub sensor_limits: SensorLimits,
    pub actuation: ActuationConfig,
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            ports: PortsConfig::default(),
            data_dir: Self::default_data_dir(),
            profile: Profile::default(),
            cylinders: MAX_CYLINDERS,
            control: ControlConfig::default(),
            learning: LearningSettings::default(),
            failover: FailoverConfig::default(),
            sensor_limits: SensorLimits::default(),
            actuation: ActuationConfig::default(),
        }
    }
}

impl EcuConfig {
    /// Platform data directory for fuel maps
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|base| base.join("moto-ecu"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EcuConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.control.cycle_period_ms == 0 {
            return invalid("control.cycle_period_ms must be positive".into());
        }
        if self.control.persist_interval_ms == 0 || self.control.stage_check_interval_ms == 0 {
            return invalid("persistence and stage-check intervals must be positive".into());
        }
        if !(self.control.cold_start_factor > 0.0) {
            return invalid(format!(
                "control.cold_start_factor must be positive, got {}",
                self.control.cold_start_factor
            ));
        }
        if !(self.control.ignition_pulse_ms >= 0.0) {
            return invalid("control.ignition_pulse_ms must not be negative".into());
        }
        if self.failover.miss_threshold == 0 {
            return invalid("failover.miss_threshold must be at least 1".into());
        }
        if self.cylinders == 0 || self.cylinders > MAX_CYLINDERS {
            return invalid(format!("cylinders must be in 1..={MAX_CYLINDERS}"));
        }
        if self.ports.baud_rate == 0 {
            return invalid("ports.baud_rate must be positive".into());
        }
        if !(self.learning.kp > 0.0) {
            return invalid("learning.kp must be positive".into());
        }

        let limits = &self.sensor_limits;
        for (name, range) in [
            ("rpm", &limits.rpm),
            ("map", &limits.map),
            ("afr", &limits.afr),
            ("engine_temp", &limits.engine_temp),
        ] {
            if !(range.start() < range.end()) {
                return invalid(format!("sensor_limits.{name} is empty or inverted"));
            }
        }

        Ok(())
    }
}
