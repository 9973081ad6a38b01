// Environment overrides
//
// Every override is `VORTEXL2_<NAME>`; values from the environment win over
// the configuration file.

use crate::{ConfigError, GlobalConfig, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "VORTEXL2";

/// Reads prefixed environment variables and applies them to a [`GlobalConfig`]
#[derive(Debug, Clone)]
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Full variable name for an override, e.g. `VORTEXL2_FORWARD_MODE`
    pub fn key(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name.to_uppercase())
    }

    /// Value of an override, `None` when unset
    pub fn var(&self, name: &str) -> Result<Option<String>> {
        let key = self.key(name);
        match env::var(&key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env {
                name: key,
                message: e.to_string(),
            }),
        }
    }

    /// Apply every override present in the environment.
    ///
    /// Returns the names of the variables that were applied.
    pub fn apply(&self, config: &mut GlobalConfig) -> Result<Vec<String>> {
        let mut applied = Vec::new();

        if let Some(mode) = self.var("forward_mode")? {
            config.forward_mode = mode;
            applied.push(self.key("forward_mode"));
        }
        if let Some(binary) = self.var("haproxy_binary")? {
            config.haproxy.binary = PathBuf::from(binary);
            applied.push(self.key("haproxy_binary"));
        }
        if let Some(dir) = self.var("haproxy_config_dir")? {
            config.haproxy.config_dir = PathBuf::from(dir);
            applied.push(self.key("haproxy_config_dir"));
        }
        if let Some(port) = self.var("haproxy_admin_port")? {
            config.haproxy.admin_port = port.trim().parse().map_err(|e| ConfigError::Env {
                name: self.key("haproxy_admin_port"),
                message: format!("'{}' is not a port: {}", port, e),
            })?;
            applied.push(self.key("haproxy_admin_port"));
        }

        for name in &applied {
            debug!(variable = %name, "Applied environment override");
        }
        Ok(applied)
    }

    /// Load a `.env` file into the process environment.
    ///
    /// Without an explicit path a missing `.env` is ignored.
    pub fn load_dotenv(path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| ConfigError::Env {
                    name: path.display().to_string(),
                    message: e.to_string(),
                })?;
            }
            None => {
                dotenvy::dotenv().ok();
            }
        }
        Ok(())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(ENV_PREFIX)
    }
}
