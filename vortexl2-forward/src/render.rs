//! HAProxy configuration rendering
//!
//! [`ConfigRenderer`] turns a [`RuleSet`] into HAProxy configuration text.
//! Rendering is pure: the same rule set and options always produce
//! byte-identical output, so comparing texts is enough to decide whether a
//! reload is needed.
//!
//! ## Layout
//!
//! The generated file contains a `global` and a `defaults` section, an admin
//! frontend answering the monitor URI used for health probes, and one
//! `frontend`/`backend` pair per rule in listen endpoint order.

use crate::error::RenderError;
use crate::rules::{Endpoint, Protocol, Rule, RuleSet};
use std::fmt::{self, Write};
use std::path::PathBuf;
use vortexl2_config::HaproxySettings;

/// Name of the admin frontend section
pub const ADMIN_FRONTEND: &str = "vortexl2_admin";

/// Rendered HAProxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigText(String);

impl ConfigText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ConfigText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<[u8]> for ConfigText {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Static options shared by every rendered configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub client_timeout_ms: u64,
    pub server_timeout_ms: u64,
    /// Admin stats socket; exposes listeners for seamless reloads
    pub stats_socket: Option<PathBuf>,
    /// Admin frontend bind endpoint
    pub admin: Endpoint,
    /// URI answered with 200 while HAProxy is up
    pub monitor_uri: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from(&HaproxySettings::default())
    }
}

impl From<&HaproxySettings> for RenderOptions {
    fn from(settings: &HaproxySettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            connect_timeout_ms: settings.connect_timeout_ms,
            client_timeout_ms: settings.client_timeout_ms,
            server_timeout_ms: settings.server_timeout_ms,
            stats_socket: settings.stats_socket.clone(),
            admin: Endpoint::new(settings.admin_address.clone(), settings.admin_port),
            monitor_uri: settings.monitor_uri.clone(),
        }
    }
}

/// Renders rule sets into HAProxy configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigRenderer {
    options: RenderOptions,
}

impl ConfigRenderer {
    /// Create a renderer with the given options
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Validate and render a rule set
    pub fn render(&self, rules: &RuleSet) -> Result<ConfigText, RenderError> {
        rules.validate()?;
        for listen in rules.listeners() {
            if overlaps(listen, &self.options.admin) {
                return Err(RenderError::ReservedListen(listen.clone()));
            }
        }

        let mut out = String::new();
        self.write_config(&mut out, rules)
            .map_err(|e| RenderError::invalid_field("output", e.to_string()))?;
        Ok(ConfigText(out))
    }

    fn write_config(&self, out: &mut String, rules: &RuleSet) -> fmt::Result {
        let opts = &self.options;

        writeln!(out, "# Generated by vortexl2. Do not edit.")?;
        writeln!(out, "global")?;
        writeln!(out, "    maxconn {}", opts.max_connections)?;
        if let Some(ref socket) = opts.stats_socket {
            writeln!(
                out,
                "    stats socket {} mode 600 level admin expose-fd listeners",
                socket.display()
            )?;
        }
        writeln!(out, "    log stdout format raw local0")?;
        writeln!(out)?;

        writeln!(out, "defaults")?;
        writeln!(out, "    log global")?;
        writeln!(out, "    option dontlognull")?;
        writeln!(out, "    timeout connect {}ms", opts.connect_timeout_ms)?;
        writeln!(out, "    timeout client {}ms", opts.client_timeout_ms)?;
        writeln!(out, "    timeout server {}ms", opts.server_timeout_ms)?;
        writeln!(out)?;

        writeln!(out, "frontend {}", ADMIN_FRONTEND)?;
        writeln!(out, "    mode http")?;
        writeln!(out, "    bind {}", opts.admin)?;
        writeln!(out, "    monitor-uri {}", opts.monitor_uri)?;

        for rule in rules.rules() {
            writeln!(out)?;
            write_rule(out, rule)?;
        }

        Ok(())
    }
}

fn write_rule(out: &mut String, rule: &Rule) -> fmt::Result {
    let id = rule.listen.section_id();
    let mode = rule.protocol.as_mode();

    writeln!(out, "frontend fe_{}", id)?;
    writeln!(out, "    mode {}", mode)?;
    writeln!(out, "    bind {}", rule.listen)?;
    if rule.protocol == Protocol::Http {
        writeln!(out, "    option forwardfor")?;
    }
    writeln!(out, "    default_backend be_{}", id)?;
    writeln!(out)?;

    writeln!(out, "backend be_{}", id)?;
    writeln!(out, "    mode {}", mode)?;
    writeln!(out, "    balance roundrobin")?;
    if let Some(path) = rule.health_check.as_ref().and_then(|hc| hc.http_path.as_ref()) {
        writeln!(out, "    option httpchk GET {}", path)?;
    }

    for (index, target) in rule.targets.iter().enumerate() {
        write!(
            out,
            "    server t{} {} weight {}",
            index, target.endpoint, target.weight
        )?;
        if let Some(ref hc) = rule.health_check {
            write!(
                out,
                " check inter {}ms rise {} fall {}",
                hc.interval_ms, hc.rise, hc.fall
            )?;
        }
        writeln!(out)?;
    }

    Ok(())
}

fn is_wildcard(address: &str) -> bool {
    matches!(address, "0.0.0.0" | "::" | "*" | "")
}

fn overlaps(listen: &Endpoint, admin: &Endpoint) -> bool {
    listen.port == admin.port
        && (listen.address == admin.address
            || is_wildcard(&listen.address)
            || is_wildcard(&admin.address))
}
