// Shared handle to the process-wide configuration

use crate::{ConfigLoader, EnvLoader, GlobalConfig, HaproxySettings, Result, Validate};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Cloneable handle to the global configuration.
///
/// Components that need configuration receive a handle explicitly instead of
/// reaching for a global. When the handle was loaded from a file, mutations
/// made through it are written back to that file.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    config: Arc<RwLock<GlobalConfig>>,
    path: Option<Arc<PathBuf>>,
}

impl ConfigHandle {
    /// Create an in-memory handle
    pub fn new(config: GlobalConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path: None,
        }
    }

    /// Load configuration from a file, applying environment overrides.
    ///
    /// A missing file yields the defaults; the file is created on the first
    /// save.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let loader = ConfigLoader::auto(path)?;

        let mut config: GlobalConfig = if path.exists() {
            loader.load_file(path)?
        } else {
            debug!(path = %path.display(), "Configuration file missing, using defaults");
            GlobalConfig::default()
        };

        EnvLoader::default().apply(&mut config)?;

        config.validate()?;
        info!(path = %path.display(), mode = %config.forward_mode, "Loaded configuration");

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            path: Some(Arc::new(path.to_path_buf())),
        })
    }

    /// Whether both handles share the same underlying configuration
    pub fn same_config(&self, other: &ConfigHandle) -> bool {
        Arc::ptr_eq(&self.config, &other.config)
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Copy of the current configuration
    pub fn snapshot(&self) -> GlobalConfig {
        self.read().clone()
    }

    /// Current forward mode string, exactly as stored
    pub fn forward_mode(&self) -> String {
        self.read().forward_mode.clone()
    }

    /// Store a forward mode and persist it.
    ///
    /// Any string is accepted; whether it names a supported mode is decided
    /// by the consumer.
    pub fn set_forward_mode(&self, mode: impl Into<String>) -> Result<()> {
        let mode = mode.into();
        self.update(|config| config.forward_mode = mode)
    }

    /// Current HAProxy settings
    pub fn haproxy(&self) -> HaproxySettings {
        self.read().haproxy.clone()
    }

    /// Mutate the configuration and persist it when file-backed
    ///
    /// The change is written to disk before it becomes visible, so a failed
    /// write leaves the in-memory configuration untouched.
    pub fn update(&self, f: impl FnOnce(&mut GlobalConfig)) -> Result<()> {
        let mut config = self.write();
        let mut updated = config.clone();
        f(&mut updated);

        if let Some(ref path) = self.path {
            ConfigLoader::auto(path.as_path())?.write_file(path.as_path(), &updated)?;
            debug!(path = %path.display(), "Persisted configuration");
        }
        *config = updated;
        Ok(())
    }

    /// Write the current configuration to its backing file
    pub fn save(&self) -> Result<()> {
        self.update(|_| {})
    }

    fn read(&self) -> RwLockReadGuard<'_, GlobalConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GlobalConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(GlobalConfig::default())
    }
}
