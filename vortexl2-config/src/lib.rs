// Configuration management for VortexL2

pub mod env;
pub mod error;
pub mod handle;
pub mod loader;
pub mod settings;
pub mod validation;

pub use env::{ENV_PREFIX, EnvLoader};
pub use error::{ConfigError, Result};
pub use handle::ConfigHandle;
pub use loader::{ConfigLoader, FileFormat};
pub use settings::{
    FORWARD_MODE_HAPROXY, FORWARD_MODE_NONE, GlobalConfig, HaproxySettings, KNOWN_FORWARD_MODES,
    is_known_forward_mode,
};
pub use validation::{ConfigValidator, Validate};
