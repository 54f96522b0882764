//! Copy/reset plugin contract and registry.
//!
//! The engine looks plugins up by `(type, capability)` and never cares how a
//! plugin performs the operation.

mod command;
mod serial_reset;
mod shell;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use command::{CommandPlugin, CommandPluginConfig};
pub use serial_reset::SerialResetPlugin;
pub use shell::ShellCopyPlugin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginType {
    CopyMethod,
    ResetMethod,
    PowerCycle,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginType::CopyMethod => write!(f, "CopyMethod"),
            PluginType::ResetMethod => write!(f, "ResetMethod"),
            PluginType::PowerCycle => write!(f, "PowerCycle"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Capability '{capability}' of type {plugin_type} is already provided")]
    Duplicate {
        plugin_type: PluginType,
        capability: String,
    },

    #[error("Plugin '{0}' failed to set up")]
    SetupFailed(String),

    #[error("No {plugin_type} plugin provides capability '{capability}'")]
    UnknownCapability {
        plugin_type: PluginType,
        capability: String,
    },

    #[error("Plugin '{plugin}' requires parameter '{parameter}'")]
    MissingParameter { plugin: String, parameter: String },
}

/// Arguments handed to `execute`.
#[derive(Debug, Clone, Default)]
pub struct PluginArgs {
    pub image_path: Option<PathBuf>,
    pub destination_disk: Option<PathBuf>,
    pub serial: Option<String>,
    pub baud_rate: Option<u32>,
    pub target_id: Option<String>,
    pub polling_timeout: Duration,
}

impl PluginArgs {
    fn has(&self, parameter: &str) -> bool {
        match parameter {
            "image_path" => self.image_path.is_some(),
            "destination_disk" => self.destination_disk.is_some(),
            "serial" => self.serial.is_some(),
            "baud_rate" => self.baud_rate.is_some(),
            "target_id" => self.target_id.is_some(),
            _ => true,
        }
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn plugin_type(&self) -> PluginType;
    fn capabilities(&self) -> Vec<String>;

    /// Parameters `execute` cannot run without.
    fn required_parameters(&self) -> &[&str] {
        &[]
    }

    /// One-time initialisation; a plugin that fails it is not registered.
    fn setup(&mut self) -> bool {
        true
    }

    fn execute(&self, capability: &str, args: &PluginArgs) -> bool;
}

/// Poll until the mount point is a readable directory.
pub fn wait_for_mount_point(disk: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if std::fs::read_dir(disk).is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            warn!(disk = %disk.display(), "Mount point not ready");
            return false;
        }
        thread::sleep(Duration::from_millis(250));
    }
}

/// `(type, capability)` to plugin table.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
    index: HashMap<(PluginType, String), usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `shell` copy and `serial` reset plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for plugin in [
            Box::new(ShellCopyPlugin) as Box<dyn Plugin>,
            Box::new(SerialResetPlugin::default()),
        ] {
            if let Err(e) = registry.register(plugin) {
                warn!(error = %e, "Built-in plugin rejected");
            }
        }
        registry
    }

    /// Validate capability uniqueness, run `setup`, then index the plugin.
    pub fn register(&mut self, mut plugin: Box<dyn Plugin>) -> Result<(), PluginError> {
        let plugin_type = plugin.plugin_type();
        let capabilities = plugin.capabilities();
        for capability in &capabilities {
            if self.index.contains_key(&(plugin_type, capability.clone())) {
                return Err(PluginError::Duplicate {
                    plugin_type,
                    capability: capability.clone(),
                });
            }
        }
        if !plugin.setup() {
            return Err(PluginError::SetupFailed(plugin.name().to_string()));
        }

        debug!(name = %plugin.name(), plugin_type = %plugin_type, ?capabilities, "Plugin registered");
        let slot = self.plugins.len();
        self.plugins.push(plugin);
        for capability in capabilities {
            self.index.insert((plugin_type, capability), slot);
        }
        Ok(())
    }

    pub fn has(&self, plugin_type: PluginType, capability: &str) -> bool {
        self.index.contains_key(&(plugin_type, capability.to_string()))
    }

    /// Sorted capabilities registered for a type.
    pub fn capabilities(&self, plugin_type: PluginType) -> Vec<String> {
        let mut caps: Vec<String> = self
            .index
            .keys()
            .filter(|(t, _)| *t == plugin_type)
            .map(|(_, c)| c.clone())
            .collect();
        caps.sort();
        caps
    }

    /// Look up the plugin, check its required parameters and execute it.
    pub fn call(
        &self,
        plugin_type: PluginType,
        capability: &str,
        args: &PluginArgs,
    ) -> Result<bool, PluginError> {
        let slot = self
            .index
            .get(&(plugin_type, capability.to_string()))
            .ok_or_else(|| PluginError::UnknownCapability {
                plugin_type,
                capability: capability.to_string(),
            })?;
        let plugin = &self.plugins[*slot];
        for parameter in plugin.required_parameters() {
            if !args.has(parameter) {
                return Err(PluginError::MissingParameter {
                    plugin: plugin.name().to_string(),
                    parameter: parameter.to_string(),
                });
            }
        }
        info!(plugin = %plugin.name(), capability = %capability, "Calling plugin");
        Ok(plugin.execute(capability, args))
    }

    /// Like [`PluginRegistry::call`] but folds errors into `false`.
    pub fn try_call(&self, plugin_type: PluginType, capability: &str, args: &PluginArgs) -> bool {
        match self.call(plugin_type, capability, args) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "Plugin call failed");
                false
            }
        }
    }
}
