//! HAProxy process management
//!
//! This module owns the lifecycle of the external HAProxy process: starting
//! it, reloading it gracefully with a new configuration file, probing its
//! health and stopping it.
//!
//! Reloads use HAProxy's soft-finish mechanism: a successor process is
//! launched with `-sf <old pid>` (and `-x <stats socket>` for listening
//! socket handoff when a stats socket is configured). The old process stops
//! accepting, drains its connections and exits; it is reaped in the
//! background and killed if it outlives the drain timeout.

use crate::error::{ForwardError, Result};
use crate::health::{HealthProbe, HealthStatus, MonitorUriProbe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use vortexl2_config::HaproxySettings;

/// Upper bound for `haproxy -c` and `haproxy -v`
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle state of the managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Process is not running
    #[default]
    Stopped,
    /// Process is starting
    Starting,
    /// Process is running normally
    Running,
    /// A successor process is being brought up
    Reloading,
    /// Process is stopping
    Stopping,
    /// Process exited without being asked to
    Failed,
}

impl ProcessState {
    /// Check whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Failed)
                | (Running, Reloading)
                | (Running, Stopping)
                | (Running, Failed)
                | (Reloading, Running)
                | (Reloading, Failed)
                | (Stopping, Stopped)
                | (Failed, Starting)
                | (Failed, Stopping)
                | (Failed, Stopped)
        )
    }

    /// Whether a process is expected to be alive in this state
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Reloading)
    }
}

/// Identity of one running HAProxy process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Configuration file the process was started with
    pub config_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Lifecycle operations on the external proxy process
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Start the proxy with a configuration file
    async fn start(&self, config_path: &Path) -> Result<ProcessHandle>;

    /// Gracefully replace the process behind `handle` with one running `new_config`
    async fn reload(&self, handle: &ProcessHandle, new_config: &Path) -> Result<ProcessHandle>;

    /// Probe the process behind `handle` with a bounded timeout
    async fn health_check(&self, handle: &ProcessHandle) -> HealthStatus;

    /// Stop the process; always completes, forcing termination if needed
    async fn stop(&self, handle: &ProcessHandle) -> Result<()>;

    /// Current lifecycle state, detecting crashes
    async fn state(&self) -> ProcessState;
}

struct Managed {
    handle: ProcessHandle,
    child: Child,
}

struct Inner {
    state: ProcessState,
    current: Option<Managed>,
}

impl Inner {
    fn transition(&mut self, next: ProcessState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ForwardError::process(format!(
                "illegal state transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!("HAProxy state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn managed_for(&self, handle: &ProcessHandle) -> Result<()> {
        match self.current {
            Some(ref managed) if managed.handle.pid == handle.pid => Ok(()),
            Some(ref managed) => Err(ForwardError::process(format!(
                "stale handle for PID {}, running PID is {}",
                handle.pid, managed.handle.pid
            ))),
            None => Err(ForwardError::NotRunning),
        }
    }

    /// Mark the process failed if it has exited on its own
    fn poll_exit(&mut self) {
        if !self.state.is_active() {
            return;
        }
        if let Some(ref mut managed) = self.current {
            match managed.child.try_wait() {
                Ok(Some(status)) => {
                    error!(pid = managed.handle.pid, "HAProxy exited unexpectedly: {}", status);
                    self.state = ProcessState::Failed;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to poll HAProxy process: {}", e),
            }
        }
    }
}

/// [`ProcessController`] driving a real `haproxy` binary
pub struct HaproxyController {
    settings: HaproxySettings,
    probe: Arc<dyn HealthProbe>,
    inner: Mutex<Inner>,
}

impl HaproxyController {
    /// Create a controller probing the monitor URI from `settings`
    pub fn new(settings: HaproxySettings) -> Result<Self> {
        let probe = Arc::new(MonitorUriProbe::from_settings(&settings)?);
        Ok(Self::with_probe(settings, probe))
    }

    /// Create a controller with a custom health probe
    pub fn with_probe(settings: HaproxySettings, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            settings,
            probe,
            inner: Mutex::new(Inner {
                state: ProcessState::Stopped,
                current: None,
            }),
        }
    }

    pub fn settings(&self) -> &HaproxySettings {
        &self.settings
    }

    /// Run `haproxy -c` against a configuration file
    pub async fn check_config(&self, config_path: &Path) -> std::result::Result<(), String> {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("-c").arg("-q").arg("-f").arg(config_path);
        cmd.kill_on_drop(true);

        let output = match tokio::time::timeout(CHECK_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(format!(
                    "binary not found: {}",
                    self.settings.binary.display()
                ));
            }
            Ok(Err(e)) => return Err(format!("failed to run config check: {}", e)),
            Err(_) => return Err("config check timed out".to_string()),
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "config {} rejected ({}): {}",
                config_path.display(),
                output.status,
                stderr.trim()
            ))
        }
    }

    async fn spawn(
        &self,
        config_path: &Path,
        soft_finish: Option<u32>,
    ) -> std::result::Result<Managed, String> {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("-f").arg(config_path);

        if let Some(old_pid) = soft_finish {
            if let Some(ref socket) = self.settings.stats_socket
                && socket.exists()
            {
                cmd.arg("-x").arg(socket);
            }
            cmd.arg("-sf").arg(old_pid.to_string());
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                format!("binary not found: {}", self.settings.binary.display())
            } else {
                e.to_string()
            }
        })?;

        let pid = child
            .id()
            .ok_or_else(|| "process exited before reporting a PID".to_string())?;
        forward_output(&mut child, pid);

        tokio::time::sleep(self.settings.startup_grace()).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(format!("exited during startup with {}", status));
            }
            Ok(None) => {}
            Err(e) => {
                child.start_kill().ok();
                return Err(format!("failed to poll new process: {}", e));
            }
        }

        self.write_pid_file(pid);
        Ok(Managed {
            handle: ProcessHandle {
                pid,
                config_path: config_path.to_path_buf(),
                started_at: Utc::now(),
            },
            child,
        })
    }

    fn write_pid_file(&self, pid: u32) {
        if let Some(ref pid_path) = self.settings.pid_file {
            if let Some(parent) = pid_path.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                warn!("Failed to create PID file directory: {}", e);
            }
            if let Err(e) = std::fs::write(pid_path, pid.to_string()) {
                warn!("Failed to write PID file: {}", e);
            }
        }
    }

    fn remove_pid_file(&self) {
        if let Some(ref pid_path) = self.settings.pid_file
            && pid_path.exists()
            && let Err(e) = std::fs::remove_file(pid_path)
        {
            warn!("Failed to remove PID file: {}", e);
        }
    }

    /// Let a replaced process drain, then make sure it is gone
    fn reap_replaced(&self, mut old: Managed) {
        let drain = self.settings.drain_timeout();
        tokio::spawn(async move {
            let pid = old.handle.pid;
            match tokio::time::timeout(drain, old.child.wait()).await {
                Ok(Ok(status)) => debug!(pid, "Replaced HAProxy exited: {}", status),
                Ok(Err(e)) => warn!(pid, "Error waiting for replaced HAProxy: {}", e),
                Err(_) => {
                    warn!(pid, "Replaced HAProxy still draining after {:?}, killing", drain);
                    if let Err(e) = old.child.kill().await {
                        warn!(pid, "Failed to kill replaced HAProxy: {}", e);
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ProcessController for HaproxyController {
    async fn start(&self, config_path: &Path) -> Result<ProcessHandle> {
        let mut inner = self.inner.lock().await;
        inner.poll_exit();
        if inner.state.is_active()
            && let Some(ref managed) = inner.current
        {
            return Err(ForwardError::AlreadyRunning(managed.handle.pid));
        }

        // A crashed process still holds a child entry; drop it first.
        if let Some(mut crashed) = inner.current.take() {
            crashed.child.kill().await.ok();
        }
        if inner.state == ProcessState::Failed {
            inner.transition(ProcessState::Stopped)?;
        }

        inner.transition(ProcessState::Starting)?;
        info!(config = %config_path.display(), "Starting HAProxy...");

        if let Err(message) = self.check_config(config_path).await {
            inner.transition(ProcessState::Stopped)?;
            return Err(ForwardError::StartFailed(message));
        }

        match self.spawn(config_path, None).await {
            Ok(managed) => {
                let handle = managed.handle.clone();
                inner.current = Some(managed);
                inner.transition(ProcessState::Running)?;
                info!(pid = handle.pid, "HAProxy started");
                Ok(handle)
            }
            Err(message) => {
                inner.transition(ProcessState::Stopped)?;
                Err(ForwardError::StartFailed(message))
            }
        }
    }

    async fn reload(&self, handle: &ProcessHandle, new_config: &Path) -> Result<ProcessHandle> {
        let mut inner = self.inner.lock().await;
        inner.poll_exit();
        inner.managed_for(handle)?;

        if inner.state == ProcessState::Failed {
            // Nothing left to hand connections over from.
            warn!(pid = handle.pid, "HAProxy has crashed, starting fresh instead of reloading");
            drop(inner);
            return self.start(new_config).await.map_err(|e| ForwardError::ReloadFailed {
                attempts: 1,
                message: e.to_string(),
            });
        }

        inner.transition(ProcessState::Reloading)?;
        info!(
            pid = handle.pid,
            config = %new_config.display(),
            "Reloading HAProxy configuration..."
        );

        if let Err(message) = self.check_config(new_config).await {
            inner.transition(ProcessState::Running)?;
            return Err(ForwardError::ReloadFailed {
                attempts: 1,
                message,
            });
        }

        let attempts = self.settings.reload_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.spawn(new_config, Some(handle.pid)).await {
                Ok(managed) => {
                    let new_handle = managed.handle.clone();
                    if let Some(old) = inner.current.replace(managed) {
                        self.reap_replaced(old);
                    }
                    inner.transition(ProcessState::Running)?;
                    info!(
                        old_pid = handle.pid,
                        pid = new_handle.pid,
                        "HAProxy configuration reloaded"
                    );
                    return Ok(new_handle);
                }
                Err(message) => {
                    warn!(attempt, attempts, "HAProxy reload attempt failed: {}", message);
                    last_error = message;
                }
            }
        }

        inner.transition(ProcessState::Running)?;
        inner.poll_exit();
        Err(ForwardError::ReloadFailed {
            attempts,
            message: last_error,
        })
    }

    async fn health_check(&self, handle: &ProcessHandle) -> HealthStatus {
        if !pid_alive(handle.pid) {
            return HealthStatus::Unhealthy;
        }

        match tokio::time::timeout(self.settings.health_timeout(), self.probe.probe(handle)).await {
            Ok(result) if result.status == HealthStatus::Healthy => HealthStatus::Healthy,
            Ok(_) => HealthStatus::Unhealthy,
            Err(_) => {
                debug!(pid = handle.pid, "Health probe timed out");
                HealthStatus::Unhealthy
            }
        }
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.poll_exit();
        inner.managed_for(handle)?;
        inner.transition(ProcessState::Stopping)?;
        info!(pid = handle.pid, "Stopping HAProxy...");

        let mut result = Ok(());
        if let Some(mut managed) = inner.current.take() {
            // SIGUSR1 is HAProxy's graceful stop: finish connections then exit.
            #[cfg(unix)]
            {
                use nix::sys::signal::{self, Signal};
                use nix::unistd::Pid;
                if let Err(e) = signal::kill(Pid::from_raw(handle.pid as i32), Signal::SIGUSR1) {
                    debug!(pid = handle.pid, "Failed to signal HAProxy: {}", e);
                }
            }

            match tokio::time::timeout(self.settings.stop_timeout(), managed.child.wait()).await {
                Ok(Ok(_)) => info!(pid = handle.pid, "HAProxy stopped gracefully"),
                Ok(Err(e)) => error!(pid = handle.pid, "Error waiting for HAProxy to stop: {}", e),
                Err(_) => {
                    warn!(pid = handle.pid, "HAProxy did not stop gracefully, forcing kill");
                    managed.child.kill().await.ok();
                    result = Err(ForwardError::StopTimeout { pid: handle.pid });
                }
            }
        }

        inner.transition(ProcessState::Stopped)?;
        self.remove_pid_file();
        result
    }

    async fn state(&self) -> ProcessState {
        let mut inner = self.inner.lock().await;
        inner.poll_exit();
        inner.state
    }
}

fn forward_output(child: &mut Child, pid: u32) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(pid, "[haproxy] {}", line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(pid, "[haproxy] {}", line);
            }
        });
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    signal::kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Check if HAProxy is installed and return its version line
pub async fn check_haproxy_installed(binary: Option<&Path>) -> Result<String> {
    let binary = binary
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("haproxy"));

    let mut cmd = Command::new(&binary);
    cmd.arg("-v").kill_on_drop(true);

    let output = tokio::time::timeout(CHECK_TIMEOUT, cmd.output())
        .await
        .map_err(|_| ForwardError::timeout(format!("{} -v", binary.display())))?
        .map_err(|e| ForwardError::StartFailed(format!("{}: {}", binary.display(), e)))?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    } else {
        Err(ForwardError::StartFailed(format!(
            "HAProxy not found or failed to execute: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_binary_settings(dir: &Path) -> HaproxySettings {
        HaproxySettings {
            binary: dir.join("no-such-haproxy"),
            pid_file: Some(dir.join("haproxy.pid")),
            stats_socket: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_state_machine() {
        use ProcessState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Reloading));
        assert!(Reloading.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Reloading));
        assert!(!Reloading.can_transition_to(Reloading));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let controller = HaproxyController::new(missing_binary_settings(dir.path())).unwrap();
        assert_eq!(controller.state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_start_with_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("haproxy.cfg");
        std::fs::write(&config, "global\n").unwrap();

        let controller = HaproxyController::new(missing_binary_settings(dir.path())).unwrap();
        let err = controller.start(&config).await.unwrap_err();

        assert!(matches!(err, ForwardError::StartFailed(ref m) if m.contains("binary not found")));
        assert_eq!(controller.state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_process() {
        let dir = tempfile::tempdir().unwrap();
        let controller = HaproxyController::new(missing_binary_settings(dir.path())).unwrap();
        let handle = ProcessHandle {
            pid: 1,
            config_path: dir.path().join("haproxy.cfg"),
            started_at: Utc::now(),
        };

        assert!(matches!(
            controller.stop(&handle).await,
            Err(ForwardError::NotRunning)
        ));
        assert!(matches!(
            controller.reload(&handle, &handle.config_path).await,
            Err(ForwardError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_check_installed_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_haproxy_installed(Some(&dir.path().join("no-such-haproxy"))).await;
        assert!(result.is_err());
    }
}
