//! Fuel map persistence errors

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or saving a fuel map file
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Fuel map not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid fuel map JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid fuel map: {0}")]
    InvalidMap(String),
}
