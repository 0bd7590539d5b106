//! Configuration for the call engine
//!
//! Settings are layered: `config/default.toml` (optional), an optional
//! environment-specific file, then `CALL_ENGINE_*` environment
//! variables. Every tunable has a default, so an empty configuration is
//! valid.

pub mod settings;

pub use settings::{load_settings, EngineSettings, Settings};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
