#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

//! # VortexL2 Forward
//!
//! HAProxy-backed port forwarding for VortexL2 tunnels.
//!
//! A declarative [`RuleSet`] is rendered into an HAProxy configuration and
//! applied to a supervised HAProxy process. Every change is confirmed by a
//! health probe; a change that does not come up healthy is rolled back to the
//! last configuration that did.
//!
//! ## Applying rules
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vortexl2_config::HaproxySettings;
//! use vortexl2_forward::{Endpoint, ReconciliationEngine, Rule, RuleSet};
//!
//! # tokio_test::block_on(async {
//! let engine = Arc::new(ReconciliationEngine::from_settings(&HaproxySettings::default())?);
//!
//! let rules = RuleSet::try_new([
//!     Rule::tcp(Endpoint::new("0.0.0.0", 8080)).target(Endpoint::new("10.8.0.2", 80)),
//! ])?;
//!
//! let outcome = engine.reconcile(rules).await?;
//! println!("{:?}", outcome);
//! # Ok::<(), vortexl2_forward::ForwardError>(())
//! # }).unwrap();
//! ```
//!
//! ## Mode selection
//!
//! ```rust,no_run
//! use vortexl2_config::ConfigHandle;
//! use vortexl2_forward::ModeSelector;
//!
//! # fn example() -> vortexl2_forward::Result<()> {
//! let config = ConfigHandle::load("/etc/vortexl2/config.toml")?;
//! let selector = ModeSelector::new(config);
//!
//! match selector.forward_manager()? {
//!     Some(_engine) => println!("forwarding through HAProxy"),
//!     None => println!("forwarding disabled"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Hot reload from a rule file
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vortexl2_config::HaproxySettings;
//! use vortexl2_forward::{Reconciler, ReconciliationEngine, RuleWatcher};
//!
//! # async fn example() -> vortexl2_forward::Result<()> {
//! let engine = Arc::new(ReconciliationEngine::from_settings(&HaproxySettings::default())?);
//! let reconciler = Reconciler::spawn(engine);
//!
//! let _watcher = RuleWatcher::new("/etc/vortexl2/rules.toml", reconciler.submitter()).run()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod health;
pub mod mode;
pub mod process;
pub mod reconcile;
pub mod render;
pub mod rules;
pub mod source;

// Re-export main types
pub use error::{ForwardError, RenderError, Result};
pub use health::{
    HealthCheckResult, HealthProbe, HealthState, HealthStatus, MonitorUriProbe, RetryPolicy,
};
pub use mode::{
    ControllerFactory, ForwardManager, ForwardMode, ModeSelector, get_forward_manager,
    get_forward_mode, set_forward_mode,
};
pub use process::{
    HaproxyController, ProcessController, ProcessHandle, ProcessState, check_haproxy_installed,
};
pub use reconcile::{
    AppliedState, ReconcileOutcome, Reconciler, ReconciliationEngine,
    ReconciliationEngineBuilder, RuleSubmitter,
};
pub use render::{ADMIN_FRONTEND, ConfigRenderer, ConfigText, RenderOptions};
pub use rules::{Endpoint, HealthCheckSpec, Protocol, Rule, RuleSet, Target};
pub use source::{RuleFile, RuleWatcher, load_rules_file, save_rules_file};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{ForwardError, RenderError, Result};
    pub use crate::health::{HealthProbe, HealthStatus, RetryPolicy};
    pub use crate::mode::{ForwardManager, ForwardMode, ModeSelector};
    pub use crate::process::{HaproxyController, ProcessController, ProcessHandle, ProcessState};
    pub use crate::reconcile::{AppliedState, ReconcileOutcome, Reconciler, ReconciliationEngine};
    pub use crate::render::{ConfigRenderer, RenderOptions};
    pub use crate::rules::{Endpoint, HealthCheckSpec, Protocol, Rule, RuleSet, Target};
    pub use crate::source::{RuleWatcher, load_rules_file};
}
