// Global settings schema

use crate::{ConfigValidator, Result, Validate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Forward mode that disables port forwarding
pub const FORWARD_MODE_NONE: &str = "none";

/// Forward mode that delegates forwarding to HAProxy
pub const FORWARD_MODE_HAPROXY: &str = "haproxy";

/// Every forward mode this release understands
pub const KNOWN_FORWARD_MODES: &[&str] = &[FORWARD_MODE_NONE, FORWARD_MODE_HAPROXY];

/// Check whether a forward mode value is recognized
pub fn is_known_forward_mode(mode: &str) -> bool {
    KNOWN_FORWARD_MODES.contains(&mode.trim().to_lowercase().as_str())
}

/// Process-wide VortexL2 configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Port forwarding mode (`none` or `haproxy`)
    pub forward_mode: String,
    /// HAProxy process and rendering settings
    pub haproxy: HaproxySettings,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            forward_mode: FORWARD_MODE_NONE.to_string(),
            haproxy: HaproxySettings::default(),
        }
    }
}

impl Validate for GlobalConfig {
    // The forward mode is deliberately not checked here: unknown values are
    // stored as-is and rejected when a manager is requested.
    fn validate(&self) -> Result<()> {
        self.haproxy.validate()
    }
}

/// Settings for the managed HAProxy instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaproxySettings {
    /// Path to the haproxy binary
    pub binary: PathBuf,
    /// Directory that receives generated configuration files
    pub config_dir: PathBuf,
    /// PID file written for the running instance
    pub pid_file: Option<PathBuf>,
    /// Admin stats socket, also used for listener handoff on reload
    pub stats_socket: Option<PathBuf>,
    /// Address of the admin frontend serving the monitor URI
    pub admin_address: String,
    /// Port of the admin frontend
    pub admin_port: u16,
    /// URI answered by HAProxy when it is up
    pub monitor_uri: String,
    /// Global maxconn
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub client_timeout_ms: u64,
    pub server_timeout_ms: u64,
    /// An exit within this window after spawn counts as a failed start
    pub startup_grace_ms: u64,
    /// How long a replaced process may drain before it is killed
    pub drain_timeout_secs: u64,
    /// How long stop waits after SIGUSR1 before SIGKILL
    pub stop_timeout_secs: u64,
    /// Bound on a single health probe
    pub health_timeout_ms: u64,
    /// Graceful reload attempts before giving up
    pub reload_attempts: u32,
    /// Health probes after a reload before declaring it failed
    pub health_attempts: u32,
    pub health_initial_backoff_ms: u64,
    pub health_max_backoff_ms: u64,
}

impl Default for HaproxySettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("haproxy"),
            config_dir: PathBuf::from("/etc/vortexl2/haproxy"),
            pid_file: Some(PathBuf::from("/run/vortexl2/haproxy.pid")),
            stats_socket: Some(PathBuf::from("/run/vortexl2/haproxy.sock")),
            admin_address: "127.0.0.1".to_string(),
            admin_port: 9099,
            monitor_uri: "/vortexl2-health".to_string(),
            max_connections: 4096,
            connect_timeout_ms: 5_000,
            client_timeout_ms: 60_000,
            server_timeout_ms: 60_000,
            startup_grace_ms: 500,
            drain_timeout_secs: 30,
            stop_timeout_secs: 10,
            health_timeout_ms: 2_000,
            reload_attempts: 2,
            health_attempts: 3,
            health_initial_backoff_ms: 250,
            health_max_backoff_ms: 2_000,
        }
    }
}

impl HaproxySettings {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Base URL of the admin frontend, e.g. `http://127.0.0.1:9099`
    pub fn admin_url(&self) -> String {
        if self.admin_address.contains(':') {
            format!("http://[{}]:{}", self.admin_address, self.admin_port)
        } else {
            format!("http://{}:{}", self.admin_address, self.admin_port)
        }
    }
}

impl Validate for HaproxySettings {
    fn validate(&self) -> Result<()> {
        ConfigValidator::not_empty(&self.binary.to_string_lossy(), "haproxy.binary")?;
        ConfigValidator::not_empty(&self.config_dir.to_string_lossy(), "haproxy.config_dir")?;
        ConfigValidator::not_empty(&self.admin_address, "haproxy.admin_address")?;
        ConfigValidator::is_port(self.admin_port, "haproxy.admin_port")?;
        ConfigValidator::is_uri_path(&self.monitor_uri, "haproxy.monitor_uri")?;
        ConfigValidator::in_range(self.max_connections, 1, 1_000_000, "haproxy.max_connections")?;
        ConfigValidator::in_range(self.reload_attempts, 1, 10, "haproxy.reload_attempts")?;
        ConfigValidator::in_range(self.health_attempts, 1, 20, "haproxy.health_attempts")?;
        ConfigValidator::in_range(self.health_timeout_ms, 1, 60_000, "haproxy.health_timeout_ms")?;
        Ok(())
    }
}
