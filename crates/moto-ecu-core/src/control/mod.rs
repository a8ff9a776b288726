//! Engine control
//!
//! [`ControlLoop`] owns an [`EcuContext`] (fuel maps, failover coordinator,
//! actuation scheduler, operating state) and advances it one tick at a time.
//! Everything outside the ECU core (display, GPIO, supply sensing) is reached
//! through [`HostIo`].

mod cadence;
mod cycle;
mod dyno;
mod io;
mod state;

pub use cadence::Cadence;
pub use cycle::{ControlLoop, CycleOutcome, ShutdownReason};
pub use dyno::DynoLatch;
pub use io::{DisplayStatus, HostIo};
pub use state::{ControlState, EcuContext, FuelMapSet};

use thiserror::Error;

use crate::actuation::ActuationError;

/// Errors raised while bringing up the control loop
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("No connected cylinders detected")]
    NoCylinders,

    #[error("Actuation setup failed: {0}")]
    Actuation(#[from] ActuationError),
}
