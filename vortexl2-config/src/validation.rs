// Settings validation

use crate::{ConfigError, Result};
use std::fmt::Display;

/// Implemented by every settings section
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Field checks shared by settings sections
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn not_empty(value: &str, field: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::invalid(field, "must not be empty"));
        }
        Ok(())
    }

    /// Inclusive bounds check
    pub fn in_range<T: PartialOrd + Display>(value: T, min: T, max: T, field: &str) -> Result<()> {
        if value < min || value > max {
            return Err(ConfigError::invalid(
                field,
                format!("{} is outside {}..={}", value, min, max),
            ));
        }
        Ok(())
    }

    /// Port 0 asks the OS for an ephemeral port, which HAProxy cannot be probed on
    pub fn is_port(value: u16, field: &str) -> Result<()> {
        if value == 0 {
            return Err(ConfigError::invalid(field, "port 0 is not allowed"));
        }
        Ok(())
    }

    /// HAProxy `monitor-uri` style path
    pub fn is_uri_path(value: &str, field: &str) -> Result<()> {
        if !value.starts_with('/') {
            return Err(ConfigError::invalid(field, format!("'{}' must start with '/'", value)));
        }
        if value.contains(char::is_whitespace) {
            return Err(ConfigError::invalid(field, "must not contain whitespace"));
        }
        Ok(())
    }
}
