//! Error types for port forwarding
//!
//! This module provides error types for rule validation, process management,
//! health checking and reconciliation.

use crate::rules::Endpoint;
use thiserror::Error;

/// Result type alias for forwarding operations
pub type Result<T> = std::result::Result<T, ForwardError>;

/// Structural problems found while validating or rendering a rule set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// A rule has no backend targets
    #[error("rule {listen} has no targets")]
    EmptyTargets { listen: Endpoint },

    /// A target has a zero weight
    #[error("rule {listen} target {target} has zero weight")]
    ZeroWeight { listen: Endpoint, target: Endpoint },

    /// Two rules bind the same listen endpoint
    #[error("duplicate listen endpoint {0}")]
    DuplicateListen(Endpoint),

    /// A rule binds the endpoint reserved for the admin frontend
    #[error("listen endpoint {0} is reserved for the admin frontend")]
    ReservedListen(Endpoint),

    /// Any other invalid field
    #[error("invalid value for '{field}': {message}")]
    InvalidField { field: String, message: String },
}

impl RenderError {
    /// Create an invalid field error
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors that can occur during forwarding operations
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Rule set rejected before any file write or process interaction
    #[error("Invalid forwarding rules: {0}")]
    Render(#[from] RenderError),

    /// HAProxy could not be started
    #[error("Failed to start HAProxy: {0}")]
    StartFailed(String),

    /// Graceful reload failed on every attempt
    #[error("Failed to reload HAProxy after {attempts} attempt(s): {message}")]
    ReloadFailed { attempts: u32, message: String },

    /// Shutdown had to be forced; the process is gone
    #[error("HAProxy (PID {pid}) ignored graceful shutdown and was killed")]
    StopTimeout { pid: u32 },

    /// A new configuration could not be applied
    #[error("Reconciliation failed ({}): {cause}", rollback_label(.rolled_back))]
    Reconcile {
        cause: Box<ForwardError>,
        rolled_back: bool,
    },

    /// Forward mode value is not recognized
    #[error("Unsupported forward mode: '{0}'")]
    UnsupportedMode(String),

    /// Process management error
    #[error("Process error: {0}")]
    Process(String),

    /// Health check error
    #[error("Health check failed: {0}")]
    HealthCheck(String),

    /// Already running
    #[error("HAProxy is already running with PID {0}")]
    AlreadyRunning(u32),

    /// Not running
    #[error("HAProxy is not currently running")]
    NotRunning,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Rule file or watcher error
    #[error("Rule source error: {0}")]
    RuleSource(String),

    /// Global configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] vortexl2_config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn rollback_label(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "rolled back"
    } else {
        "rollback failed"
    }
}

impl ForwardError {
    /// Create a process error
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Create a health check error
    pub fn health_check(msg: impl Into<String>) -> Self {
        Self::HealthCheck(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a reconcile error wrapping its cause
    pub fn reconcile(cause: ForwardError, rolled_back: bool) -> Self {
        Self::Reconcile {
            cause: Box::new(cause),
            rolled_back,
        }
    }

    /// Check if the error is recoverable by keeping or restoring the old config
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Render(_)
            | Self::StartFailed(_)
            | Self::ReloadFailed { .. }
            | Self::HealthCheck(_)
            | Self::Timeout(_) => true,
            Self::Reconcile { rolled_back, .. } => *rolled_back,
            _ => false,
        }
    }

    /// Check if the error is a process error
    pub fn is_process_error(&self) -> bool {
        matches!(
            self,
            Self::Process(_)
                | Self::StartFailed(_)
                | Self::ReloadFailed { .. }
                | Self::StopTimeout { .. }
                | Self::AlreadyRunning(_)
                | Self::NotRunning
        )
    }

    /// Underlying cause of a reconcile error, or the error itself
    pub fn root_cause(&self) -> &ForwardError {
        match self {
            Self::Reconcile { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}
