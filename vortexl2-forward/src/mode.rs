//! Forward mode selection
//!
//! The configured `forward_mode` decides whether port forwarding is handled
//! by HAProxy at all. The selector reads it through an explicit
//! [`ConfigHandle`] and hands out the shared engine when it is enabled.

use crate::error::{ForwardError, Result};
use crate::process::{HaproxyController, ProcessController};
use crate::reconcile::ReconciliationEngine;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex};
use tracing::{debug, info, warn};
use vortexl2_config::{
    ConfigHandle, FORWARD_MODE_HAPROXY, FORWARD_MODE_NONE, HaproxySettings,
    is_known_forward_mode,
};

/// Name kept for callers that think in terms of "the forward manager"
pub type ForwardManager = ReconciliationEngine;

/// Builds the process controller for a new engine
pub type ControllerFactory =
    Arc<dyn Fn(&HaproxySettings) -> Result<Arc<dyn ProcessController>> + Send + Sync>;

/// Supported forward modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForwardMode {
    /// Forwarding disabled
    #[default]
    None,
    /// Forwarding through HAProxy
    Haproxy,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardMode::None => FORWARD_MODE_NONE,
            ForwardMode::Haproxy => FORWARD_MODE_HAPROXY,
        }
    }
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardMode {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self> {
        let mode = s.trim();
        if mode.eq_ignore_ascii_case(FORWARD_MODE_NONE) {
            Ok(ForwardMode::None)
        } else if mode.eq_ignore_ascii_case(FORWARD_MODE_HAPROXY) {
            Ok(ForwardMode::Haproxy)
        } else {
            Err(ForwardError::UnsupportedMode(s.to_string()))
        }
    }
}

/// Hands out the forward manager according to the configured mode
pub struct ModeSelector {
    config: ConfigHandle,
    factory: Option<ControllerFactory>,
    manager: Mutex<Option<Arc<ForwardManager>>>,
}

impl ModeSelector {
    /// Create a selector driving a real HAProxy
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            factory: None,
            manager: Mutex::new(None),
        }
    }

    /// Use a custom controller for the engine built by this selector
    pub fn with_controller_factory(mut self, factory: ControllerFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Configured mode, exactly as stored
    pub fn forward_mode(&self) -> String {
        self.config.forward_mode()
    }

    /// Store a new mode.
    ///
    /// Unknown values are accepted and only rejected when a manager is
    /// requested. Changing the mode does not stop a running proxy.
    pub fn set_forward_mode(&self, mode: impl Into<String>) -> Result<()> {
        let mode = mode.into();
        if !is_known_forward_mode(mode.trim()) {
            warn!(mode = %mode, "Storing unrecognized forward mode");
        }
        self.config.set_forward_mode(mode.clone())?;
        info!(mode = %mode, "Forward mode changed");
        Ok(())
    }

    /// The active engine, or `None` when forwarding is disabled.
    ///
    /// The engine is built on first use and shared afterwards.
    pub fn forward_manager(&self) -> Result<Option<Arc<ForwardManager>>> {
        match self.forward_mode().parse::<ForwardMode>()? {
            ForwardMode::None => Ok(None),
            ForwardMode::Haproxy => self.haproxy_manager().map(Some),
        }
    }

    fn haproxy_manager(&self) -> Result<Arc<ForwardManager>> {
        let mut cached = self
            .manager
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(ref engine) = *cached {
            return Ok(Arc::clone(engine));
        }

        let settings = self.config.haproxy();
        let controller: Arc<dyn ProcessController> = match self.factory {
            Some(ref factory) => factory(&settings)?,
            None => Arc::new(HaproxyController::new(settings.clone())?),
        };

        debug!(config_dir = %settings.config_dir.display(), "Creating HAProxy forward manager");
        let engine = Arc::new(
            ReconciliationEngine::builder()
                .settings(settings)
                .controller(controller)
                .build()?,
        );
        *cached = Some(Arc::clone(&engine));
        Ok(engine)
    }
}

/// Selectors handed out by the free functions, one per configuration
static SELECTORS: LazyLock<Mutex<Vec<Arc<ModeSelector>>>> = LazyLock::new(Mutex::default);

/// The selector shared by every free-function caller of `config`
fn shared_selector(config: &ConfigHandle) -> Arc<ModeSelector> {
    let mut selectors = SELECTORS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(selector) = selectors.iter().find(|s| s.config.same_config(config)) {
        return Arc::clone(selector);
    }

    let selector = Arc::new(ModeSelector::new(config.clone()));
    selectors.push(Arc::clone(&selector));
    selector
}

/// Manager for `config`, shared with every other caller using the same config
pub fn get_forward_manager(config: &ConfigHandle) -> Result<Option<Arc<ForwardManager>>> {
    shared_selector(config).forward_manager()
}

pub fn get_forward_mode(config: &ConfigHandle) -> String {
    config.forward_mode()
}

pub fn set_forward_mode(config: &ConfigHandle, mode: impl Into<String>) -> Result<()> {
    shared_selector(config).set_forward_mode(mode)
}
