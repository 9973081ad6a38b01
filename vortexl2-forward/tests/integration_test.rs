//! Integration tests for vortexl2-forward

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vortexl2_config::{ConfigHandle, GlobalConfig, HaproxySettings};
use vortexl2_forward::*;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Start(PathBuf),
    Reload(PathBuf),
    Stop(u32),
}

/// Scripted stand-in for HAProxy
#[derive(Default)]
struct MockController {
    next_pid: AtomicU32,
    state: Mutex<(ProcessState, Option<ProcessHandle>)>,
    calls: Mutex<Vec<Call>>,
    unhealthy_marker: Mutex<Option<String>>,
    reload_fails: AtomicBool,
    stop_fails: AtomicBool,
    failing_checks: AtomicU32,
    delay: Mutex<Duration>,
    busy: AtomicBool,
    overlapped: AtomicBool,
}

impl MockController {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    /// Configs containing `marker` never pass a health check
    fn unhealthy_when(&self, marker: &str) {
        *self.unhealthy_marker.lock().unwrap() = Some(marker.to_string());
    }

    /// The next `count` health checks fail whatever is running
    fn fail_next_checks(&self, count: u32) {
        self.failing_checks.store(count, Ordering::SeqCst);
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn crash(&self) {
        self.state.lock().unwrap().0 = ProcessState::Failed;
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn current(&self) -> Option<ProcessHandle> {
        self.state.lock().unwrap().1.clone()
    }

    async fn busy_section(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Like the real controller, only the current PID may be acted on
    fn check_current(&self, handle: &ProcessHandle) -> Result<()> {
        match self.current() {
            Some(current) if current.pid == handle.pid => Ok(()),
            Some(current) => Err(ForwardError::process(format!(
                "stale handle for PID {}, running PID is {}",
                handle.pid, current.pid
            ))),
            None => Err(ForwardError::NotRunning),
        }
    }

    fn launch(&self, config_path: &Path) -> ProcessHandle {
        let handle = ProcessHandle {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            config_path: config_path.to_path_buf(),
            started_at: Utc::now(),
        };
        *self.state.lock().unwrap() = (ProcessState::Running, Some(handle.clone()));
        handle
    }
}

#[async_trait]
impl ProcessController for MockController {
    async fn start(&self, config_path: &Path) -> Result<ProcessHandle> {
        self.calls.lock().unwrap().push(Call::Start(config_path.to_path_buf()));
        self.busy_section().await;
        if self.state.lock().unwrap().0 == ProcessState::Running {
            return Err(ForwardError::AlreadyRunning(0));
        }
        Ok(self.launch(config_path))
    }

    async fn reload(&self, handle: &ProcessHandle, new_config: &Path) -> Result<ProcessHandle> {
        self.calls.lock().unwrap().push(Call::Reload(new_config.to_path_buf()));
        self.busy_section().await;
        self.check_current(handle)?;
        if self.reload_fails.load(Ordering::SeqCst) {
            return Err(ForwardError::ReloadFailed {
                attempts: 2,
                message: "scripted failure".to_string(),
            });
        }
        Ok(self.launch(new_config))
    }

    async fn health_check(&self, handle: &ProcessHandle) -> HealthStatus {
        if self.state.lock().unwrap().0 != ProcessState::Running
            || self.current().map(|h| h.pid) != Some(handle.pid)
        {
            return HealthStatus::Unhealthy;
        }
        if self
            .failing_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return HealthStatus::Unhealthy;
        }
        let marker = self.unhealthy_marker.lock().unwrap().clone();
        let config = std::fs::read_to_string(&handle.config_path).unwrap_or_default();
        match marker {
            Some(marker) if config.contains(&marker) => HealthStatus::Unhealthy,
            _ => HealthStatus::Healthy,
        }
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Stop(handle.pid));
        self.check_current(handle)?;
        if self.stop_fails.load(Ordering::SeqCst) {
            return Err(ForwardError::process("scripted stop failure"));
        }
        *self.state.lock().unwrap() = (ProcessState::Stopped, None);
        Ok(())
    }

    async fn state(&self) -> ProcessState {
        self.state.lock().unwrap().0
    }
}

fn engine_with(mock: &Arc<MockController>, dir: &Path) -> Arc<ReconciliationEngine> {
    let engine = ReconciliationEngine::builder()
        .controller(mock.clone())
        .config_dir(dir)
        .retry_policy(RetryPolicy {
            attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        })
        .build()
        .unwrap();
    Arc::new(engine)
}

fn forward(port: u16, target: &str) -> Rule {
    Rule::tcp(Endpoint::new("0.0.0.0", port)).target(target.parse().unwrap())
}

async fn wait_for_rules(engine: &ReconciliationEngine, rules: &RuleSet) -> AppliedState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(applied) = engine.applied().await
                && applied.rules == *rules
            {
                return applied;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

/// Swap file contents in one step so a watcher never reads a partial write
fn replace_file(path: &Path, contents: &str) {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).unwrap();
    std::fs::rename(&tmp, path).unwrap();
}

fn config_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

#[tokio::test]
async fn test_first_apply_starts_haproxy() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    let rules = RuleSet::new([forward(8080, "10.0.0.1:80")]);
    let outcome = engine.reconcile(rules.clone()).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Applied { generation: 1 });
    let applied = engine.applied().await.unwrap();
    assert_eq!(applied.rules, rules);
    assert_eq!(applied.generation, 1);

    let path = dir.path().join("haproxy-000001.cfg");
    assert_eq!(mock.calls(), vec![Call::Start(path.clone())]);
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("bind 0.0.0.0:8080"));
    assert!(text.contains("10.0.0.1:80"));
}

#[tokio::test]
async fn test_same_rules_twice_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    let rules = RuleSet::new([forward(8080, "10.0.0.1:80")]);
    engine.reconcile(rules.clone()).await.unwrap();
    let outcome = engine.reconcile(rules).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Unchanged);
    assert_eq!(mock.calls().len(), 1);
    assert_eq!(config_files(dir.path()).len(), 1);
}

#[tokio::test]
async fn test_change_reloads_and_removes_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    engine
        .reconcile(RuleSet::new([forward(8080, "10.0.0.1:80")]))
        .await
        .unwrap();
    let outcome = engine
        .reconcile(RuleSet::new([forward(8080, "10.0.0.2:80")]))
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Applied { generation: 2 });
    let second = dir.path().join("haproxy-000002.cfg");
    assert_eq!(config_files(dir.path()), vec![second.clone()]);
    assert_eq!(mock.calls()[1], Call::Reload(second.clone()));
    assert_eq!(mock.current().unwrap().config_path, second);
}

#[tokio::test]
async fn test_unhealthy_change_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    let good = RuleSet::new([forward(8080, "10.0.0.1:80")]);
    engine.reconcile(good.clone()).await.unwrap();
    let good_path = dir.path().join("haproxy-000001.cfg");

    mock.unhealthy_when("10.0.0.66");
    let err = engine
        .reconcile(RuleSet::new([forward(8080, "10.0.0.66:80")]))
        .await
        .unwrap_err();

    match err {
        ForwardError::Reconcile { ref cause, rolled_back } => {
            assert!(rolled_back);
            assert!(matches!(**cause, ForwardError::HealthCheck(_)));
        }
        other => panic!("unexpected error: {}", other),
    }

    let applied = engine.applied().await.unwrap();
    assert_eq!(applied.rules, good);
    assert_eq!(applied.generation, 1);
    assert_eq!(mock.current().unwrap().config_path, good_path);
    assert_eq!(config_files(dir.path()), vec![good_path.clone()]);

    let calls = mock.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2], Call::Reload(good_path));
}

#[tokio::test]
async fn test_unhealthy_restore_keeps_tracking_live_process() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    let good = RuleSet::new([forward(8080, "10.0.0.1:80")]);
    engine.reconcile(good.clone()).await.unwrap();
    let good_path = dir.path().join("haproxy-000001.cfg");

    // Both the new configuration and the restored one fail their probes.
    mock.fail_next_checks(4);
    let err = engine
        .reconcile(RuleSet::new([forward(8080, "10.0.0.2:80")]))
        .await
        .unwrap_err();
    assert!(matches!(err, ForwardError::Reconcile { rolled_back: false, .. }));

    let live = mock.current().unwrap();
    assert_eq!(live.config_path, good_path);
    let applied = engine.applied().await.unwrap();
    assert_eq!(applied.rules, good);
    assert_eq!(applied.handle, live);

    // Once the restored process is healthy again it is served as-is.
    assert_eq!(
        engine.reconcile(good).await.unwrap(),
        ReconcileOutcome::Unchanged
    );

    let newer = RuleSet::new([forward(8080, "10.0.0.3:80")]);
    assert_eq!(
        engine.reconcile(newer).await.unwrap(),
        ReconcileOutcome::Applied { generation: 3 }
    );
    assert_eq!(mock.calls().last(), Some(&Call::Reload(dir.path().join("haproxy-000003.cfg"))));

    engine.shutdown().await.unwrap();
    assert!(engine.applied().await.is_none());
    assert!(mock.current().is_none());
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_config() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    let good = RuleSet::new([forward(8080, "10.0.0.1:80")]);
    engine.reconcile(good.clone()).await.unwrap();
    let pid = mock.current().unwrap().pid;

    mock.reload_fails.store(true, Ordering::SeqCst);
    let err = engine
        .reconcile(RuleSet::new([forward(9090, "10.0.0.2:80")]))
        .await
        .unwrap_err();

    assert!(matches!(err, ForwardError::Reconcile { rolled_back: true, .. }));
    assert!(matches!(err.root_cause(), ForwardError::ReloadFailed { .. }));
    assert_eq!(engine.applied().await.unwrap().rules, good);
    assert_eq!(mock.current().unwrap().pid, pid);
    assert_eq!(mock.calls().len(), 2);
    assert_eq!(config_files(dir.path()).len(), 1);
}

#[tokio::test]
async fn test_unhealthy_first_apply_stops_process() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    mock.unhealthy_when("10.0.0.66");
    let err = engine
        .reconcile(RuleSet::new([forward(8080, "10.0.0.66:80")]))
        .await
        .unwrap_err();

    assert!(matches!(err, ForwardError::Reconcile { rolled_back: true, .. }));
    assert!(engine.applied().await.is_none());
    assert_eq!(mock.state().await, ProcessState::Stopped);
    assert!(matches!(mock.calls().last(), Some(Call::Stop(_))));
    assert!(config_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_empty_targets_rejected_before_any_side_effect() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    let rules = RuleSet::new([Rule::tcp(Endpoint::new("0.0.0.0", 8080))]);
    let err = engine.reconcile(rules).await.unwrap_err();

    assert!(matches!(
        err,
        ForwardError::Render(RenderError::EmptyTargets { .. })
    ));
    assert!(mock.calls().is_empty());
    assert!(config_files(dir.path()).is_empty());
    assert!(engine.applied().await.is_none());
}

#[tokio::test]
async fn test_duplicate_listen_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    let rules = vec![forward(8080, "10.0.0.1:80"), forward(8080, "10.0.0.2:80")];
    assert!(matches!(
        RuleSet::try_new(rules.clone()),
        Err(RenderError::DuplicateListen(_))
    ));

    let err = engine.reconcile(RuleSet::new(rules)).await.unwrap_err();
    match err {
        ForwardError::Render(RenderError::DuplicateListen(endpoint)) => {
            assert_eq!(endpoint, Endpoint::new("0.0.0.0", 8080));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(mock.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconciles_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    mock.set_delay(Duration::from_millis(20));
    let engine = engine_with(&mock, dir.path());

    let passes = (0..4u16).map(|i| {
        let engine = engine.clone();
        let rules = RuleSet::new([forward(8080, &format!("10.0.0.{}:80", i + 1))]);
        async move { engine.reconcile(rules).await }
    });
    let results = futures::future::join_all(passes).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(!mock.overlapped.load(Ordering::SeqCst));
    assert_eq!(mock.calls().len(), 4);
    assert_eq!(config_files(dir.path()).len(), 1);
}

#[tokio::test]
async fn test_reconciler_applies_only_latest_pending() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());
    let reconciler = Reconciler::spawn(engine.clone());

    let latest = RuleSet::new([forward(8080, "10.0.0.4:80")]);
    reconciler.submit(RuleSet::new([forward(8080, "10.0.0.1:80")]));
    reconciler.submit(RuleSet::new([forward(8080, "10.0.0.2:80")]));
    reconciler.submitter().submit(latest.clone());

    let applied = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(applied) = engine.applied().await {
                return applied;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(applied.rules, latest);
    assert_eq!(mock.calls().len(), 1);
    reconciler.shutdown().await;
}

#[tokio::test]
async fn test_reconciler_finishes_in_flight_pass_then_applies_newest() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    mock.set_delay(Duration::from_millis(100));
    let engine = engine_with(&mock, dir.path());
    let reconciler = Reconciler::spawn(engine.clone());

    reconciler.submit(RuleSet::new([forward(8080, "10.0.0.1:80")]));
    tokio::time::timeout(Duration::from_secs(5), async {
        while mock.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let newest = RuleSet::new([forward(8080, "10.0.0.3:80")]);
    reconciler.submit(RuleSet::new([forward(8080, "10.0.0.2:80")]));
    reconciler.submit(newest.clone());

    let applied = wait_for_rules(&engine, &newest).await;
    assert_eq!(applied.generation, 2);
    assert_eq!(
        mock.calls(),
        vec![
            Call::Start(dir.path().join("haproxy-000001.cfg")),
            Call::Reload(dir.path().join("haproxy-000002.cfg")),
        ]
    );
    assert!(!mock.overlapped.load(Ordering::SeqCst));
    reconciler.shutdown().await;
}

#[tokio::test]
async fn test_crashed_process_recovered_on_next_pass() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    let rules = RuleSet::new([forward(8080, "10.0.0.1:80")]);
    engine.reconcile(rules.clone()).await.unwrap();
    let first_pid = mock.current().unwrap().pid;

    mock.crash();
    let outcome = engine.reconcile(rules).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Recovered { generation: 1 });
    assert_eq!(mock.state().await, ProcessState::Running);
    let applied = engine.applied().await.unwrap();
    assert_ne!(applied.handle.pid, first_pid);
    assert_eq!(applied.handle.config_path, dir.path().join("haproxy-000001.cfg"));
}

#[tokio::test]
async fn test_shutdown_stops_process_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    engine
        .reconcile(RuleSet::new([forward(8080, "10.0.0.1:80")]))
        .await
        .unwrap();
    engine.shutdown().await.unwrap();

    assert!(engine.applied().await.is_none());
    assert_eq!(mock.state().await, ProcessState::Stopped);
    assert!(matches!(mock.calls().last(), Some(Call::Stop(_))));
    assert!(config_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_failed_shutdown_keeps_applied_state() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    engine
        .reconcile(RuleSet::new([forward(8080, "10.0.0.1:80")]))
        .await
        .unwrap();
    let pid = mock.current().unwrap().pid;

    mock.stop_fails.store(true, Ordering::SeqCst);
    assert!(engine.shutdown().await.is_err());
    assert_eq!(engine.applied().await.unwrap().handle.pid, pid);
    assert_eq!(mock.state().await, ProcessState::Running);
    assert_eq!(config_files(dir.path()).len(), 1);

    mock.stop_fails.store(false, Ordering::SeqCst);
    engine.shutdown().await.unwrap();
    assert!(engine.applied().await.is_none());
    assert_eq!(mock.state().await, ProcessState::Stopped);
}

#[tokio::test]
async fn test_health_monitor_records_status() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let engine = engine_with(&mock, dir.path());

    engine
        .reconcile(RuleSet::new([forward(8080, "10.0.0.1:80")]))
        .await
        .unwrap();

    let monitor = engine.spawn_health_monitor(Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.health().status().await, HealthStatus::Healthy);
    let last = engine.health().last_result().await.unwrap();
    assert_eq!(last.response_time_ms, None);

    mock.crash();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.health().status().await, HealthStatus::Unhealthy);
    monitor.abort();
}

#[tokio::test]
async fn test_mode_selector_with_injected_controller() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockController::new();
    let config = ConfigHandle::new(GlobalConfig {
        forward_mode: "haproxy".to_string(),
        haproxy: HaproxySettings {
            config_dir: dir.path().to_path_buf(),
            health_attempts: 1,
            health_initial_backoff_ms: 1,
            ..Default::default()
        },
    });

    let injected: Arc<dyn ProcessController> = mock.clone();
    let factory: ControllerFactory = Arc::new(
        move |_settings: &HaproxySettings| -> Result<Arc<dyn ProcessController>> {
            Ok(injected.clone())
        },
    );
    let selector = ModeSelector::new(config).with_controller_factory(factory);

    let manager = selector.forward_manager().unwrap().unwrap();
    manager
        .reconcile(RuleSet::new([forward(2222, "10.0.0.5:22")]))
        .await
        .unwrap();
    assert_eq!(mock.calls().len(), 1);

    selector.set_forward_mode("none").unwrap();
    assert!(selector.forward_manager().unwrap().is_none());
    // Disabling forwarding leaves the running proxy alone.
    assert_eq!(mock.state().await, ProcessState::Running);
}

#[tokio::test]
async fn test_rule_watcher_follows_file_changes() {
    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.toml");
    std::fs::write(
        &rules_path,
        "[[rules]]\nlisten = \"0.0.0.0:8080\"\ntargets = [{ endpoint = \"10.0.0.1:80\" }]\n",
    )
    .unwrap();

    let mock = MockController::new();
    let engine = engine_with(&mock, &dir.path().join("haproxy"));
    let reconciler = Reconciler::spawn(engine.clone());
    let _watcher = RuleWatcher::new(&rules_path, reconciler.submitter())
        .poll_interval(Duration::from_millis(50))
        .run()
        .unwrap();

    let initial = load_rules_file(&rules_path).unwrap();
    wait_for_rules(&engine, &initial).await;

    replace_file(
        &rules_path,
        "[[rules]]\nlisten = \"0.0.0.0:8080\"\ntargets = [{ endpoint = \"10.0.0.2:80\" }]\n",
    );
    let edited = load_rules_file(&rules_path).unwrap();
    assert_ne!(edited, initial);
    let applied = wait_for_rules(&engine, &edited).await;
    assert_eq!(applied.generation, 2);
    let calls = mock.calls().len();

    // A broken revision is ignored and the running rules stay in place.
    replace_file(&rules_path, "[[rules]\nlisten = ");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(engine.applied().await.unwrap().rules, edited);
    assert_eq!(mock.calls().len(), calls);
    assert_eq!(mock.state().await, ProcessState::Running);
    reconciler.shutdown().await;
}
