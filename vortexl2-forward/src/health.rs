//! Health probing for the managed HAProxy instance
//!
//! HAProxy may accept a configuration and still fail to serve it, so every
//! reload is confirmed with a probe against the admin frontend's monitor URI.
//! The same probes feed a background [`HealthState`] tracker.

use crate::error::Result;
use crate::process::ProcessHandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use vortexl2_config::HaproxySettings;

/// Health status of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Answering probes
    Healthy,
    /// Failing probes but below the failure threshold
    Degraded,
    /// Not answering probes
    Unhealthy,
    /// Not yet checked
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Check if the status indicates traffic is being served
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// What was probed
    pub target: String,
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl HealthCheckResult {
    /// Create a healthy result
    pub fn healthy(target: impl Into<String>, response_time_ms: u64, http_status: Option<u16>) -> Self {
        Self {
            target: target.into(),
            status: HealthStatus::Healthy,
            response_time_ms: Some(response_time_ms),
            http_status,
            error: None,
            checked_at: Utc::now(),
            consecutive_failures: 0,
            consecutive_successes: 1,
        }
    }

    /// Create an unhealthy result
    pub fn unhealthy(target: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            status: HealthStatus::Unhealthy,
            response_time_ms: None,
            http_status: None,
            error: Some(error.into()),
            checked_at: Utc::now(),
            consecutive_failures: 1,
            consecutive_successes: 0,
        }
    }
}

/// A lightweight liveness probe against a running HAProxy
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the process behind `handle`
    async fn probe(&self, handle: &ProcessHandle) -> HealthCheckResult;
}

/// Probes HAProxy's `monitor-uri` on the admin frontend
#[derive(Debug, Clone)]
pub struct MonitorUriProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl MonitorUriProbe {
    /// Create a probe for the given URL
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    /// Create a probe from HAProxy settings
    pub fn from_settings(settings: &HaproxySettings) -> Result<Self> {
        Self::new(
            format!("{}{}", settings.admin_url(), settings.monitor_uri),
            settings.health_timeout(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for MonitorUriProbe {
    async fn probe(&self, handle: &ProcessHandle) -> HealthCheckResult {
        let start = Instant::now();

        match self.client.get(&self.url).timeout(self.timeout).send().await {
            Ok(response) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let status = response.status().as_u16();
                if status == 200 {
                    debug!(pid = handle.pid, "Monitor URI answered in {}ms", elapsed);
                    HealthCheckResult::healthy(&self.url, elapsed, Some(status))
                } else {
                    warn!(pid = handle.pid, "Monitor URI returned status {}", status);
                    HealthCheckResult {
                        response_time_ms: Some(elapsed),
                        http_status: Some(status),
                        ..HealthCheckResult::unhealthy(
                            &self.url,
                            format!("Unexpected status code: {}", status),
                        )
                    }
                }
            }
            Err(e) => {
                debug!(pid = handle.pid, "Monitor URI probe failed: {}", e);
                HealthCheckResult::unhealthy(&self.url, e.to_string())
            }
        }
    }
}

/// Retry schedule used to confirm a reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Build from HAProxy settings
    pub fn from_settings(settings: &HaproxySettings) -> Self {
        Self {
            attempts: settings.health_attempts.max(1),
            initial_delay: Duration::from_millis(settings.health_initial_backoff_ms),
            max_delay: Duration::from_millis(settings.health_max_backoff_ms),
        }
    }

    /// Delay before the given attempt (1-based); doubles each time up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Rolling health state of the managed process
pub struct HealthState {
    last: RwLock<Option<HealthCheckResult>>,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl HealthState {
    /// Create a tracker with rise/fall thresholds
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            last: RwLock::new(None),
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Fold a probe result into the state and return the adjusted result
    pub async fn record(&self, mut result: HealthCheckResult) -> HealthCheckResult {
        let mut last = self.last.write().await;
        if let Some(ref prev) = *last {
            if result.status == HealthStatus::Healthy {
                result.consecutive_successes = prev.consecutive_successes + 1;
                result.consecutive_failures = 0;

                if result.consecutive_successes < self.healthy_threshold
                    && prev.status == HealthStatus::Unhealthy
                {
                    result.status = HealthStatus::Unhealthy;
                }
            } else {
                result.consecutive_failures = prev.consecutive_failures + 1;
                result.consecutive_successes = 0;

                if result.consecutive_failures < self.unhealthy_threshold
                    && prev.status.is_available()
                {
                    result.status = HealthStatus::Degraded;
                }
            }
        }

        *last = Some(result.clone());
        result
    }

    /// Latest recorded status
    pub async fn status(&self) -> HealthStatus {
        self.last
            .read()
            .await
            .as_ref()
            .map(|r| r.status)
            .unwrap_or_default()
    }

    /// Latest recorded result
    pub async fn last_result(&self) -> Option<HealthCheckResult> {
        self.last.read().await.clone()
    }

    /// Forget recorded history, e.g. after the process was replaced
    pub async fn reset(&self) {
        *self.last.write().await = None;
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(2, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_availability() {
        assert!(HealthStatus::Healthy.is_available());
        assert!(HealthStatus::Degraded.is_available());
        assert!(!HealthStatus::Unhealthy.is_available());
        assert!(!HealthStatus::Unknown.is_available());
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for(40), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let settings = HaproxySettings {
            health_attempts: 5,
            health_initial_backoff_ms: 100,
            health_max_backoff_ms: 400,
            ..Default::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay_for(4), Duration::from_millis(400));
    }

    #[test]
    fn test_monitor_probe_url() {
        let probe = MonitorUriProbe::from_settings(&HaproxySettings::default()).unwrap();
        assert_eq!(probe.url(), "http://127.0.0.1:9099/vortexl2-health");
    }

    #[tokio::test]
    async fn test_health_state_thresholds() {
        let state = HealthState::new(2, 3);
        assert_eq!(state.status().await, HealthStatus::Unknown);

        let r = state.record(HealthCheckResult::healthy("p", 1, None)).await;
        assert_eq!(r.status, HealthStatus::Healthy);

        // One failure only degrades
        let r = state.record(HealthCheckResult::unhealthy("p", "refused")).await;
        assert_eq!(r.status, HealthStatus::Degraded);
        let r = state.record(HealthCheckResult::unhealthy("p", "refused")).await;
        assert_eq!(r.status, HealthStatus::Degraded);
        let r = state.record(HealthCheckResult::unhealthy("p", "refused")).await;
        assert_eq!(r.status, HealthStatus::Unhealthy);
        assert_eq!(r.consecutive_failures, 3);

        // Recovery needs two successes
        let r = state.record(HealthCheckResult::healthy("p", 1, None)).await;
        assert_eq!(r.status, HealthStatus::Unhealthy);
        let r = state.record(HealthCheckResult::healthy("p", 1, None)).await;
        assert_eq!(r.status, HealthStatus::Healthy);

        state.reset().await;
        assert!(state.last_result().await.is_none());
    }
}
