//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to a node over a link
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link timeout")]
    Timeout,

    #[error("Link disconnected")]
    Disconnected,

    #[error("Link outbound queue full")]
    Backpressure,

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame that could not be turned into a typed message
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Empty frame")]
    Empty,

    #[error("Malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Unknown cylinder: {0}")]
    UnknownCylinder(u8),
}
