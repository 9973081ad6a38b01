// Errors raised while loading, validating or persisting VortexL2 configuration

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Extension is missing or not one of `toml`/`json`
    #[error("Unsupported configuration format for {path}: expected .toml or .json")]
    UnsupportedFormat { path: PathBuf },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format} configuration: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },

    /// A setting holds a value the proxy cannot run with
    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    /// An environment override could not be applied
    #[error("Invalid environment override {name}: {message}")]
    Env { name: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
