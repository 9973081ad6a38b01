//! Forwarding rules
//!
//! A [`Rule`] maps one listen endpoint to an ordered list of weighted backend
//! targets. A [`RuleSet`] is an immutable snapshot of every rule the proxy
//! should serve; a change in desired state is expressed by building a new
//! `RuleSet`.
//!
//! ## Example
//!
//! ```rust
//! use vortexl2_forward::{Endpoint, Rule, RuleSet};
//!
//! let rules = RuleSet::try_new([
//!     Rule::tcp(Endpoint::new("0.0.0.0", 443))
//!         .target(Endpoint::new("10.8.0.2", 443)),
//!     Rule::tcp(Endpoint::new("0.0.0.0", 8443))
//!         .weighted_target(Endpoint::new("10.8.0.2", 8443), 3)
//!         .weighted_target(Endpoint::new("10.8.0.3", 8443), 1),
//! ])
//! .unwrap();
//!
//! assert_eq!(rules.len(), 2);
//! ```

use crate::error::RenderError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::str::FromStr;
use std::sync::Arc;

/// An `address:port` pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Identifier usable inside HAProxy section names.
    ///
    /// Distinct endpoints always get distinct ids: `_` is doubled and any
    /// character HAProxy does not accept in a name becomes `_<hex>_`.
    pub fn section_id(&self) -> String {
        let mut id = String::with_capacity(self.address.len() + 6);
        for c in self.address.chars() {
            match c {
                c if c.is_ascii_alphanumeric() || c == '-' || c == '.' => id.push(c),
                '_' => id.push_str("__"),
                c => {
                    let _ = write!(id, "_{:x}_", u32::from(c));
                }
            }
        }
        let _ = write!(id, "_{}", self.port);
        id
    }

    fn validate(&self, field: &str) -> Result<(), RenderError> {
        if self.address.trim().is_empty() {
            return Err(RenderError::invalid_field(field, "address cannot be empty"));
        }
        if self.address.contains(char::is_whitespace) {
            return Err(RenderError::invalid_field(
                field,
                format!("address '{}' contains whitespace", self.address),
            ));
        }
        if self.port == 0 {
            return Err(RenderError::invalid_field(
                field,
                format!("{} has port 0", self),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| RenderError::invalid_field("endpoint", format!("'{}' has no port", s)))?;
        let port = port.parse::<u16>().map_err(|e| {
            RenderError::invalid_field("endpoint", format!("'{}' has an invalid port: {}", s, e))
        })?;
        let address = address.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(address, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = RenderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Protocol handled by a forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP passthrough (default)
    #[default]
    Tcp,
    /// HTTP-aware proxying
    Http,
}

impl Protocol {
    /// HAProxy `mode` keyword
    pub fn as_mode(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
        }
    }
}

/// Weighted backend target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub endpoint: Endpoint,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl Target {
    /// Create a target with weight 1
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            weight: 1,
        }
    }

    /// Set the weight
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Per-rule backend health check policy, executed by HAProxy itself
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSpec {
    /// Interval between checks in milliseconds
    pub interval_ms: u32,
    /// Consecutive successes before a target is considered up
    pub rise: u32,
    /// Consecutive failures before a target is considered down
    pub fall: u32,
    /// HTTP path to probe (HTTP rules only)
    pub http_path: Option<String>,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            rise: 2,
            fall: 3,
            http_path: None,
        }
    }
}

impl HealthCheckSpec {
    /// Create a health check with default thresholds
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the check interval in milliseconds
    pub fn interval_ms(mut self, interval_ms: u32) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Set rise and fall thresholds
    pub fn thresholds(mut self, rise: u32, fall: u32) -> Self {
        self.rise = rise;
        self.fall = fall;
        self
    }

    /// Probe an HTTP path instead of a bare TCP connect
    pub fn http_path(mut self, path: impl Into<String>) -> Self {
        self.http_path = Some(path.into());
        self
    }
}

/// A single forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub listen: Endpoint,
    #[serde(default)]
    pub protocol: Protocol,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

impl Rule {
    /// Create a rule with no targets yet
    pub fn new(listen: Endpoint, protocol: Protocol) -> Self {
        Self {
            listen,
            protocol,
            targets: Vec::new(),
            health_check: None,
        }
    }

    /// Create a TCP rule
    pub fn tcp(listen: Endpoint) -> Self {
        Self::new(listen, Protocol::Tcp)
    }

    /// Create an HTTP rule
    pub fn http(listen: Endpoint) -> Self {
        Self::new(listen, Protocol::Http)
    }

    /// Add a target with weight 1
    pub fn target(self, endpoint: Endpoint) -> Self {
        self.weighted_target(endpoint, 1)
    }

    /// Add a weighted target
    pub fn weighted_target(mut self, endpoint: Endpoint, weight: u32) -> Self {
        self.targets.push(Target::new(endpoint).weight(weight));
        self
    }

    /// Attach a health check policy
    pub fn health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }

    /// Validate the rule's own invariants
    pub fn validate(&self) -> Result<(), RenderError> {
        self.listen.validate("listen")?;

        if self.targets.is_empty() {
            return Err(RenderError::EmptyTargets {
                listen: self.listen.clone(),
            });
        }

        for target in &self.targets {
            target.endpoint.validate("target")?;
            if target.weight == 0 {
                return Err(RenderError::ZeroWeight {
                    listen: self.listen.clone(),
                    target: target.endpoint.clone(),
                });
            }
            // HAProxy caps server weights at 256
            if target.weight > 256 {
                return Err(RenderError::invalid_field(
                    "weight",
                    format!("{} weight {} exceeds 256", target.endpoint, target.weight),
                ));
            }
        }

        if let Some(ref hc) = self.health_check {
            if hc.interval_ms == 0 || hc.rise == 0 || hc.fall == 0 {
                return Err(RenderError::invalid_field(
                    "health_check",
                    format!("rule {} needs non-zero interval, rise and fall", self.listen),
                ));
            }
            if let Some(ref path) = hc.http_path {
                if self.protocol != Protocol::Http {
                    return Err(RenderError::invalid_field(
                        "health_check.http_path",
                        format!("rule {} is not an HTTP rule", self.listen),
                    ));
                }
                if !path.starts_with('/') || path.contains(char::is_whitespace) {
                    return Err(RenderError::invalid_field(
                        "health_check.http_path",
                        format!("'{}' must be an absolute path without whitespace", path),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Immutable snapshot of desired forwarding rules.
///
/// Rules are kept sorted by listen endpoint, so sets built from the same
/// rules in any order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Rule>", into = "Vec<Rule>")]
pub struct RuleSet {
    rules: Arc<[Rule]>,
}

impl RuleSet {
    /// Build a rule set without validating it
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut rules: Vec<Rule> = rules.into_iter().collect();
        rules.sort_by(|a, b| a.listen.cmp(&b.listen));
        Self {
            rules: rules.into(),
        }
    }

    /// Build and validate a rule set
    pub fn try_new(rules: impl IntoIterator<Item = Rule>) -> Result<Self, RenderError> {
        let set = Self::new(rules);
        set.validate()?;
        Ok(set)
    }

    /// Check every rule and listen endpoint uniqueness
    pub fn validate(&self) -> Result<(), RenderError> {
        for rule in self.rules.iter() {
            rule.validate()?;
        }
        for pair in self.rules.windows(2) {
            if pair[0].listen == pair[1].listen {
                return Err(RenderError::DuplicateListen(pair[0].listen.clone()));
            }
        }
        Ok(())
    }

    /// Rules in listen endpoint order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Look up the rule bound to a listen endpoint
    pub fn get(&self, listen: &Endpoint) -> Option<&Rule> {
        self.rules.iter().find(|r| &r.listen == listen)
    }

    /// Listen endpoints in order
    pub fn listeners(&self) -> impl Iterator<Item = &Endpoint> {
        self.rules.iter().map(|r| &r.listen)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl From<Vec<Rule>> for RuleSet {
    fn from(rules: Vec<Rule>) -> Self {
        Self::new(rules)
    }
}

impl From<RuleSet> for Vec<Rule> {
    fn from(set: RuleSet) -> Self {
        set.rules.to_vec()
    }
}
