//! Reconciliation of desired rules against the running proxy
//!
//! [`ReconciliationEngine`] is the only owner of [`AppliedState`], the record
//! of what HAProxy is actually serving. Every change goes through a
//! commit-or-rollback pass:
//!
//! 1. An identical rule set is a no-op, unless the process has crashed, in
//!    which case the known-good configuration is restarted.
//! 2. The rules are rendered; invalid rules are rejected before anything
//!    touches disk or the process.
//! 3. The configuration is written to a fresh file, never over the active one.
//! 4. HAProxy is started or gracefully reloaded with the new file.
//! 5. Health is confirmed with bounded retries. On success the new state is
//!    committed and the previous file deleted.
//! 6. Otherwise the previous file is reloaded and the rejected one deleted.
//!
//! Passes are serialized. Each runs on its own task so an abandoned caller
//! cannot interrupt a pass half way.

use crate::error::{ForwardError, Result};
use crate::health::{HealthCheckResult, HealthState, HealthStatus, RetryPolicy};
use crate::process::{HaproxyController, ProcessController, ProcessHandle, ProcessState};
use crate::render::{ConfigRenderer, ConfigText, RenderOptions};
use crate::rules::RuleSet;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vortexl2_config::HaproxySettings;

/// The last rule set confirmed healthy and the process serving it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedState {
    pub rules: RuleSet,
    pub handle: ProcessHandle,
    pub generation: u64,
    pub applied_at: DateTime<Utc>,
}

/// Result of a successful reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Desired rules are already being served
    Unchanged,
    /// New rules committed under this generation
    Applied { generation: u64 },
    /// Rules were unchanged but the crashed process was restarted
    Recovered { generation: u64 },
}

/// Drives HAProxy towards a desired rule set
pub struct ReconciliationEngine {
    controller: Arc<dyn ProcessController>,
    renderer: ConfigRenderer,
    config_dir: PathBuf,
    retry: RetryPolicy,
    pass: Mutex<()>,
    applied: RwLock<Option<AppliedState>>,
    generation: AtomicU64,
    health: Arc<HealthState>,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("renderer", &self.renderer)
            .field("config_dir", &self.config_dir)
            .field("retry", &self.retry)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    /// Create a new engine builder
    pub fn builder() -> ReconciliationEngineBuilder {
        ReconciliationEngineBuilder::default()
    }

    /// Create an engine for a real HAProxy from settings
    pub fn from_settings(settings: &HaproxySettings) -> Result<Self> {
        Self::builder().settings(settings.clone()).build()
    }

    /// Snapshot of what is currently applied
    pub async fn applied(&self) -> Option<AppliedState> {
        self.applied.read().await.clone()
    }

    /// Health tracker fed by [`spawn_health_monitor`](Self::spawn_health_monitor)
    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Bring HAProxy in line with `desired`.
    ///
    /// Concurrent calls queue and run one at a time. The pass runs on its own
    /// task and completes even if the returned future is dropped.
    pub async fn reconcile(self: &Arc<Self>, desired: RuleSet) -> Result<ReconcileOutcome> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _pass = engine.pass.lock().await;
            engine.reconcile_locked(desired).await
        })
        .await
        .map_err(|e| ForwardError::process(format!("reconciliation task failed: {}", e)))?
    }

    /// Stop HAProxy deliberately and forget the applied state
    pub async fn shutdown(&self) -> Result<()> {
        let _pass = self.pass.lock().await;
        let Some(applied) = self.applied().await else {
            return Ok(());
        };

        info!(pid = applied.handle.pid, "Shutting down port forwarding");
        match self.controller.stop(&applied.handle).await {
            Ok(()) | Err(ForwardError::NotRunning) => {}
            Err(ForwardError::StopTimeout { pid }) => {
                warn!(pid, "HAProxy had to be killed during shutdown");
            }
            // Applied state stays in place for a retry.
            Err(e) => return Err(e),
        }
        *self.applied.write().await = None;
        self.health.reset().await;
        discard(&applied.handle.config_path).await;
        Ok(())
    }

    /// Periodically probe the applied process without taking part in passes
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let Some(handle) = engine.applied().await.map(|a| a.handle) else {
                    continue;
                };

                let target = format!("haproxy[{}]", handle.pid);
                let probe = match engine.controller.health_check(&handle).await {
                    // The controller reports status only, so no latency is known.
                    HealthStatus::Healthy => HealthCheckResult {
                        response_time_ms: None,
                        ..HealthCheckResult::healthy(target, 0, None)
                    },
                    status => HealthCheckResult::unhealthy(target, format!("{:?}", status)),
                };

                let previous = engine.health.status().await;
                let result = engine.health.record(probe).await;
                if result.status != previous {
                    match result.status {
                        HealthStatus::Healthy => info!(pid = handle.pid, "HAProxy is healthy"),
                        status => warn!(pid = handle.pid, ?status, "HAProxy health changed"),
                    }
                }
            }
        })
    }

    async fn reconcile_locked(&self, desired: RuleSet) -> Result<ReconcileOutcome> {
        let current = self.applied.read().await.clone();

        if let Some(ref applied) = current
            && applied.rules == desired
        {
            if self.is_serving(&applied.handle).await {
                debug!(generation = applied.generation, "Rules unchanged, nothing to do");
                return Ok(ReconcileOutcome::Unchanged);
            }
            warn!(
                pid = applied.handle.pid,
                "Applied configuration is not being served, recovering"
            );
            return self.recover(applied).await;
        }

        let text = self.renderer.render(&desired)?;

        let (generation, path) = self.write_config(&text).await?;
        info!(generation, rules = desired.len(), "Applying forwarding rules");

        let attempt = match current {
            Some(ref applied) if self.controller.state().await != ProcessState::Stopped => {
                self.controller.reload(&applied.handle, &path).await
            }
            _ => self.controller.start(&path).await,
        };

        let new_handle = match attempt {
            Ok(handle) => handle,
            Err(e) => {
                error!(generation, "Failed to apply configuration: {}", e);
                let rolled_back = self.rollback(current.as_ref(), None).await;
                discard(&path).await;
                return Err(ForwardError::reconcile(e, rolled_back));
            }
        };

        if self.verify(&new_handle).await {
            *self.applied.write().await = Some(AppliedState {
                rules: desired,
                handle: new_handle.clone(),
                generation,
                applied_at: Utc::now(),
            });
            self.health.reset().await;

            if let Some(previous) = current
                && previous.handle.config_path != path
            {
                discard(&previous.handle.config_path).await;
            }

            info!(generation, pid = new_handle.pid, "Forwarding rules committed");
            return Ok(ReconcileOutcome::Applied { generation });
        }

        let cause = ForwardError::health_check(format!(
            "HAProxy PID {} did not become healthy after {} probe(s)",
            new_handle.pid, self.retry.attempts
        ));
        error!(generation, "{}, rolling back", cause);
        let rolled_back = self.rollback(current.as_ref(), Some(&new_handle)).await;
        discard(&path).await;
        Err(ForwardError::reconcile(cause, rolled_back))
    }

    /// Restart the known-good configuration after a crash
    async fn recover(&self, applied: &AppliedState) -> Result<ReconcileOutcome> {
        let running = match self.controller.state().await {
            ProcessState::Stopped => None,
            _ => Some(&applied.handle),
        };

        if self.restore(applied, running).await {
            Ok(ReconcileOutcome::Recovered {
                generation: applied.generation,
            })
        } else {
            Err(ForwardError::reconcile(
                ForwardError::health_check(format!(
                    "could not restore generation {}",
                    applied.generation
                )),
                false,
            ))
        }
    }

    /// Return to the previous state after a failed pass.
    ///
    /// `failed` is the process running the rejected configuration, if the
    /// start or reload got that far. Returns whether the proxy is back on the
    /// last known-good configuration (or, without one, fully stopped).
    async fn rollback(&self, previous: Option<&AppliedState>, failed: Option<&ProcessHandle>) -> bool {
        let Some(previous) = previous else {
            // No known-good configuration: the rejected one must not stay up.
            return match failed {
                Some(handle) => self.stop_quietly(handle).await,
                None => true,
            };
        };

        match failed {
            None if self.is_serving(&previous.handle).await => {
                info!(
                    generation = previous.generation,
                    "Previous configuration still serving, nothing to roll back"
                );
                true
            }
            None => {
                let running = match self.controller.state().await {
                    ProcessState::Stopped => None,
                    _ => Some(&previous.handle),
                };
                self.restore(previous, running).await
            }
            Some(handle) => self.restore(previous, Some(handle)).await,
        }
    }

    /// Put `applied`'s configuration back in service, replacing `running`
    async fn restore(&self, applied: &AppliedState, running: Option<&ProcessHandle>) -> bool {
        let config_path = &applied.handle.config_path;
        warn!(
            generation = applied.generation,
            config = %config_path.display(),
            "Restoring last known-good configuration"
        );

        let attempt = match running {
            Some(handle) => self.controller.reload(handle, config_path).await,
            None => self.controller.start(config_path).await,
        };

        let handle = match attempt {
            Ok(handle) => handle,
            Err(e) => {
                error!("Rollback reload failed: {}", e);
                if let Some(handle) = running {
                    self.stop_quietly(handle).await;
                }
                match self.controller.start(config_path).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        error!("Could not restart known-good configuration: {}", e);
                        return false;
                    }
                }
            }
        };

        let healthy = self.verify(&handle).await;
        if !healthy {
            error!(pid = handle.pid, "Restored configuration is not healthy");
        }

        // Record the live process even when it is unhealthy.
        *self.applied.write().await = Some(AppliedState {
            handle,
            ..applied.clone()
        });
        if healthy {
            self.health.reset().await;
        }
        healthy
    }

    async fn stop_quietly(&self, handle: &ProcessHandle) -> bool {
        match self.controller.stop(handle).await {
            Ok(()) | Err(ForwardError::NotRunning) => true,
            Err(ForwardError::StopTimeout { pid }) => {
                warn!(pid, "HAProxy had to be killed");
                true
            }
            Err(e) => {
                error!(pid = handle.pid, "Failed to stop HAProxy: {}", e);
                false
            }
        }
    }

    async fn is_serving(&self, handle: &ProcessHandle) -> bool {
        self.controller.state().await.is_active() && self.verify(handle).await
    }

    /// Probe with backoff until healthy or out of attempts
    async fn verify(&self, handle: &ProcessHandle) -> bool {
        for attempt in 1..=self.retry.attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
            }
            match self.controller.health_check(handle).await {
                HealthStatus::Healthy => return true,
                status => debug!(pid = handle.pid, attempt, ?status, "Health probe not passing"),
            }
        }
        false
    }

    async fn write_config(&self, text: &ConfigText) -> Result<(u64, PathBuf)> {
        tokio::fs::create_dir_all(&self.config_dir).await?;

        let (generation, path) = loop {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let path = self.config_dir.join(format!("haproxy-{:06}.cfg", generation));
            if !tokio::fs::try_exists(&path).await? {
                break (generation, path);
            }
        };

        let tmp = path.with_extension("cfg.tmp");
        tokio::fs::write(&tmp, text.as_str()).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            discard(&tmp).await;
            return Err(e.into());
        }

        debug!(generation, path = %path.display(), "Wrote HAProxy configuration");
        Ok((generation, path))
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed configuration file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove configuration file: {}", e),
    }
}

/// Builder for ReconciliationEngine
#[derive(Default)]
pub struct ReconciliationEngineBuilder {
    settings: Option<HaproxySettings>,
    controller: Option<Arc<dyn ProcessController>>,
    renderer: Option<ConfigRenderer>,
    config_dir: Option<PathBuf>,
    retry: Option<RetryPolicy>,
}

impl ReconciliationEngineBuilder {
    /// Use HAProxy settings for anything not set explicitly
    pub fn settings(mut self, settings: HaproxySettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set the process controller
    pub fn controller(mut self, controller: Arc<dyn ProcessController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Set the renderer
    pub fn renderer(mut self, renderer: ConfigRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Set the directory receiving generated configuration files
    pub fn config_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(path.into());
        self
    }

    /// Set the health retry policy used after reloads
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Build the ReconciliationEngine
    pub fn build(self) -> Result<ReconciliationEngine> {
        let settings = self.settings.unwrap_or_default();

        let controller: Arc<dyn ProcessController> = match self.controller {
            Some(controller) => controller,
            None => Arc::new(HaproxyController::new(settings.clone())?),
        };

        let renderer = self
            .renderer
            .unwrap_or_else(|| ConfigRenderer::new(RenderOptions::from(&settings)));

        Ok(ReconciliationEngine {
            controller,
            renderer,
            config_dir: self.config_dir.unwrap_or_else(|| settings.config_dir.clone()),
            retry: self.retry.unwrap_or_else(|| RetryPolicy::from_settings(&settings)),
            pass: Mutex::new(()),
            applied: RwLock::new(None),
            generation: AtomicU64::new(0),
            health: Arc::new(HealthState::default()),
        })
    }
}

/// Background worker applying rule sets with latest-wins queuing.
///
/// At most one rule set waits behind the pass in flight; submitting again
/// before it starts replaces it.
pub struct Reconciler {
    submitter: RuleSubmitter,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Cloneable handle for queuing rule sets on a [`Reconciler`]
#[derive(Clone)]
pub struct RuleSubmitter {
    desired: Arc<watch::Sender<Option<RuleSet>>>,
}

impl RuleSubmitter {
    /// Queue a rule set, replacing any that has not started yet
    pub fn submit(&self, rules: RuleSet) {
        self.desired.send_replace(Some(rules));
    }
}

impl Reconciler {
    /// Start a worker for `engine`
    pub fn spawn(engine: Arc<ReconciliationEngine>) -> Self {
        let (desired, mut rx) = watch::channel::<Option<RuleSet>>(None);
        let (stop, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }

                let Some(rules) = rx.borrow_and_update().clone() else {
                    continue;
                };
                match engine.reconcile(rules).await {
                    Ok(outcome) => debug!(?outcome, "Reconciliation pass finished"),
                    Err(e) => error!("Reconciliation pass failed: {}", e),
                }
            }
            debug!("Reconciler stopped");
        });

        Self {
            submitter: RuleSubmitter {
                desired: Arc::new(desired),
            },
            stop,
            task,
        }
    }

    /// Queue a rule set, replacing any that has not started yet
    pub fn submit(&self, rules: RuleSet) {
        self.submitter.submit(rules);
    }

    pub fn submitter(&self) -> RuleSubmitter {
        self.submitter.clone()
    }

    /// Stop the worker; a pass in flight still completes, queued work is dropped
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!("Reconciler task ended abnormally: {}", e);
        }
    }
}
