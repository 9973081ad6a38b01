//! Rule files and hot reload
//!
//! Rules can live in a TOML or JSON document with a top-level `rules` array:
//!
//! ```toml
//! [[rules]]
//! listen = "0.0.0.0:8080"
//! protocol = "tcp"
//! targets = [{ endpoint = "10.0.0.1:80" }]
//! ```

use crate::error::{ForwardError, Result};
use crate::reconcile::RuleSubmitter;
use crate::rules::{Rule, RuleSet};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};
use vortexl2_config::ConfigLoader;

/// On-disk rule document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Read and validate a rule file, choosing the format from its extension
pub fn load_rules_file(path: impl AsRef<Path>) -> Result<RuleSet> {
    let path = path.as_ref();
    let file: RuleFile = ConfigLoader::auto(path)?.load_file(path)?;
    let rules = RuleSet::try_new(file.rules)?;
    debug!(path = %path.display(), rules = rules.len(), "Loaded forwarding rules");
    Ok(rules)
}

/// Write a rule set in the format matching the file extension
pub fn save_rules_file(path: impl AsRef<Path>, rules: &RuleSet) -> Result<()> {
    let path = path.as_ref();
    let file = RuleFile {
        rules: rules.rules().to_vec(),
    };
    ConfigLoader::auto(path)?.write_file(path, &file)?;
    Ok(())
}

/// Watches a rule file and submits every valid revision for reconciliation
pub struct RuleWatcher {
    path: PathBuf,
    submitter: RuleSubmitter,
    poll_interval: Duration,
}

impl RuleWatcher {
    pub fn new(path: impl Into<PathBuf>, submitter: RuleSubmitter) -> Self {
        Self {
            path: path.into(),
            submitter,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Poll interval for backends without native change notification
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Submit the current file once, then keep watching.
    ///
    /// The parent directory is watched so editors that replace the file are
    /// still noticed. Dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| {
                ForwardError::RuleSource(format!("{} is not a file path", self.path.display()))
            })?;

        submit_from(&self.path, &self.submitter);

        let path = self.path.clone();
        let submitter = self.submitter.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        info!(path = %path.display(), "Rule file changed, reloading");
                        submit_from(&path, &submitter);
                    }
                }
                Err(e) => error!("Rule watch error: {:?}", e),
            },
            Config::default().with_poll_interval(self.poll_interval),
        )
        .map_err(|e| ForwardError::RuleSource(e.to_string()))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ForwardError::RuleSource(e.to_string()))?;

        info!(path = %self.path.display(), "Rule watcher started");
        Ok(watcher)
    }
}

fn submit_from(path: &Path, submitter: &RuleSubmitter) {
    match load_rules_file(path) {
        Ok(rules) => submitter.submit(rules),
        Err(e) => error!(
            path = %path.display(),
            "Failed to load rules: {}. Keeping current configuration.", e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Endpoint;

    #[test]
    fn test_load_toml_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(
            &path,
            r#"
[[rules]]
listen = "0.0.0.0:8080"
protocol = "http"
targets = [{ endpoint = "10.0.0.1:80", weight = 3 }, { endpoint = "10.0.0.2:80" }]

[[rules]]
listen = "0.0.0.0:2222"
targets = [{ endpoint = "10.0.0.5:22" }]
"#,
        )
        .unwrap();

        let rules = load_rules_file(&path).unwrap();
        assert_eq!(rules.len(), 2);
        let web = rules.get(&Endpoint::new("0.0.0.0", 8080)).unwrap();
        assert_eq!(web.targets.len(), 2);
        assert_eq!(web.targets[0].weight, 3);
        assert_eq!(web.targets[1].weight, 1);
    }

    #[test]
    fn test_load_json_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(
            &path,
            r#"{"rules": [{"listen": "127.0.0.1:9000", "targets": [{"endpoint": "10.1.1.1:9000"}]}]}"#,
        )
        .unwrap();

        let rules = load_rules_file(&path).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(
            &path,
            r#"
[[rules]]
listen = "0.0.0.0:8080"
targets = []
"#,
        )
        .unwrap();

        let err = load_rules_file(&path).unwrap_err();
        assert!(matches!(err, ForwardError::Render(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let rules = RuleSet::new([Rule::tcp(Endpoint::new("0.0.0.0", 5000))
            .target(Endpoint::new("10.0.0.9", 5000))]);

        save_rules_file(&path, &rules).unwrap();
        assert_eq!(load_rules_file(&path).unwrap(), rules);
    }
}
