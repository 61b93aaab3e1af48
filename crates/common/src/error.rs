//! Configuration error types

use std::path::PathBuf;

use thiserror::Error;

/// Why the service configuration could not be loaded.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: {field} must be HH:MM, got: {value}")]
    TimeOfDay { field: &'static str, value: String },

    #[error("Configuration error: {0} must be greater than 0")]
    Zero(&'static str),

    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias for configuration loading
pub type Result<T> = std::result::Result<T, Error>;
