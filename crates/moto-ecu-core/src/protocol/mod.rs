//! Node Link Protocol
//!
//! Newline-framed JSON messages between the host and the sensor, actuator and
//! backup microcontroller nodes.

mod error;
mod link;
pub mod message;
pub mod serial;
mod stream;

pub use error::{LinkError, MessageError};
pub use link::{Link, MemoryLink};
pub use message::{ActuatorCommand, Directive, DynoData, Role, SensorLimits, SensorSample};
pub use serial::{list_ports, open_link, open_port, PortInfo};
pub use stream::{StreamLink, LINK_QUEUE_DEPTH, MAX_FRAME_LEN};

/// Node UART baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default budget for a single outbound frame in milliseconds
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 20;

/// Highest cylinder number the actuator node has outputs for
pub const MAX_CYLINDERS: u8 = 4;
