//! # moto-ecu Core Library
//!
//! Host-side control for a three-node motorcycle ECU.
//!
//! This library provides:
//! - Newline-framed JSON links to the sensor, actuator and backup nodes
//! - Per-cylinder, per-profile adaptive fuel maps with atomic persistence
//! - Proportional AFR learning with staged grid refinement and dyno feedback
//! - Actuation pacing against the actuator node's real-time budget
//! - Liveness-based failover to the backup node
//! - The control cycle tying it all together
//!
//! ## Example
//!
//! ```rust,ignore
//! use moto_ecu_core::prelude::*;
//!
//! let config = EcuConfig::load("moto-ecu.json")?;
//! let bench = DemoBench::new();
//! let failover = bench.coordinator(config.sensor_limits.clone(), config.failover.miss_threshold);
//! let mut ecu = ControlLoop::new(&config, failover, io)?;
//!
//! loop {
//!     if let CycleOutcome::Shutdown(_) = ecu.run_cycle(config.control.cycle_period()) {
//!         break;
//!     }
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod actuation;
pub mod config;
pub mod control;
pub mod demo;
pub mod failover;
pub mod fuel_map;
pub mod learning;
pub mod persist;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::actuation::{ActuationScheduler, ActuatorSink, FireOutcome, PinMap};
    pub use crate::config::{ConfigError, EcuConfig};
    pub use crate::control::{
        ControlError, ControlLoop, CycleOutcome, DisplayStatus, HostIo, ShutdownReason,
    };
    pub use crate::demo::DemoBench;
    pub use crate::failover::{FailoverCoordinator, NodeHealth, RoleState};
    pub use crate::fuel_map::{FuelMap, FuelMapStore, PersistenceError, Profile};
    pub use crate::learning::{LearnOutcome, LearningEngine, STAGES};
    pub use crate::persist::{persistence, PersistHandle, PersistWorker};
    pub use crate::protocol::{
        ActuatorCommand, Link, LinkError, MemoryLink, Role, SensorLimits, SensorSample, StreamLink,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
