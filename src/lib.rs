// VortexL2 - port forwarding for VortexL2 tunnels
//
// This library ties together the global configuration, the forward mode
// selector and the HAProxy reconciliation engine.

//! # VortexL2
//!
//! Forwards ports from a VortexL2 tunnel endpoint through a supervised
//! HAProxy process. The `forward_mode` setting decides whether forwarding is
//! active; when it is, a [`ReconciliationEngine`] turns declarative
//! [`RuleSet`]s into health-checked, rollback-safe HAProxy reloads.
//!
//! ```rust,no_run
//! use vortexl2::prelude::*;
//!
//! # tokio_test::block_on(async {
//! vortexl2::logging::init();
//!
//! let config = ConfigHandle::load("/etc/vortexl2/config.toml")?;
//! let selector = ModeSelector::new(config);
//!
//! if let Some(manager) = selector.forward_manager()? {
//!     let rules = load_rules_file("/etc/vortexl2/rules.toml")?;
//!     manager.reconcile(rules).await?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod logging;

// Re-export member crates
pub use vortexl2_config as config;
pub use vortexl2_forward as forward;

pub use vortexl2_config::{ConfigError, ConfigHandle, GlobalConfig, HaproxySettings};
pub use vortexl2_forward::{
    ForwardError, ForwardManager, ForwardMode, ModeSelector, ReconcileOutcome, Reconciler,
    ReconciliationEngine, Rule, RuleSet, RuleWatcher, get_forward_manager, get_forward_mode,
    set_forward_mode,
};

// Prelude for common imports
pub mod prelude {
    pub use vortexl2_config::{ConfigHandle, GlobalConfig, HaproxySettings};
    pub use vortexl2_forward::prelude::*;
}
