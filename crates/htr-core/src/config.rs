//! Run configuration, persisted as TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::flash::FlashConfig;
use crate::host_tests::DEFAULT_HOST_TEST;
use crate::lock::Kettle;
use crate::plugins::{CommandPlugin, CommandPluginConfig, PluginRegistry};
use crate::session::SessionConfig;
use crate::testspec::TestFilter;

/// Cross-process device locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub enabled: bool,
    /// Lock directory, `~/.htr` when unset.
    pub dir: Option<PathBuf>,
    /// Kettle entries older than this are ignored; `0` never expires them.
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            stale_after_secs: 12 * 60 * 60,
        }
    }
}

impl LockConfig {
    pub fn kettle(&self) -> Kettle {
        let dir = self.dir.clone().unwrap_or_else(Kettle::default_dir);
        let stale_after =
            (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs));
        Kettle::new(dir, stale_after)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Devices used at once per build.
    pub parallelism: usize,
    /// Attempts per test binary before its result stands.
    pub retry_count: u32,
    /// Flash attempts per task.
    pub copy_retry_count: u32,
    pub program_cycle_ms: u64,
    pub polling_timeout_secs: u64,
    pub forced_reset_timeout_ms: u64,
    pub verify_attempts: u32,
    pub verify_delay_ms: u64,
    pub default_timeout_secs: u64,
    pub sync_packets: u32,
    pub sync_timeout_secs: u64,
    pub copy_method: String,
    pub reset_method: String,
    pub host_test: String,
    pub shuffle: bool,
    pub shuffle_seed: Option<u64>,
    pub test_by_names: Option<String>,
    pub skip_tests: Option<String>,
    pub tags: Vec<String>,
    pub lock: LockConfig,
    /// Extra subprocess-backed copy/reset plugins.
    pub plugins: Vec<CommandPluginConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            retry_count: 1,
            copy_retry_count: 3,
            program_cycle_ms: 4000,
            polling_timeout_secs: 60,
            forced_reset_timeout_ms: 1000,
            verify_attempts: 10,
            verify_delay_ms: 500,
            default_timeout_secs: 10,
            sync_packets: 2,
            sync_timeout_secs: 5,
            copy_method: "default".to_string(),
            reset_method: "default".to_string(),
            host_test: DEFAULT_HOST_TEST.to_string(),
            shuffle: false,
            shuffle_seed: None,
            test_by_names: None,
            skip_tests: None,
            tags: Vec::new(),
            lock: LockConfig::default(),
            plugins: Vec::new(),
        }
    }
}

impl RunConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading run config {}", path.display()))?;
        let config: RunConfig = toml::from_str(&content)
            .with_context(|| format!("parsing run config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn filter(&self) -> TestFilter {
        TestFilter::new(self.test_by_names.as_deref(), self.skip_tests.as_deref())
    }

    pub fn flash_config(&self, copy_method: &str) -> FlashConfig {
        FlashConfig {
            copy_method: copy_method.to_string(),
            retry_count: self.copy_retry_count,
            program_cycle: Duration::from_millis(self.program_cycle_ms),
            verify_attempts: self.verify_attempts,
            verify_delay: Duration::from_millis(self.verify_delay_ms),
            polling_timeout: self.polling_timeout(),
        }
    }

    pub fn session_config(&self, target_id: &str, sync_packets: u32) -> SessionConfig {
        SessionConfig {
            target_id: target_id.to_string(),
            sync_packets,
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            host_test: self.host_test.clone(),
        }
    }

    pub fn polling_timeout(&self) -> Duration {
        Duration::from_secs(self.polling_timeout_secs)
    }

    pub fn forced_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.forced_reset_timeout_ms)
    }

    /// Built-in plugins plus every configured command plugin.
    pub fn plugin_registry(&self) -> Result<PluginRegistry> {
        let mut registry = PluginRegistry::with_builtins();
        for plugin in &self.plugins {
            registry
                .register(Box::new(CommandPlugin::new(plugin.clone())))
                .with_context(|| format!("registering plugin '{}'", plugin.name))?;
        }
        Ok(registry)
    }
}
