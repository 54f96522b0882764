use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Plugin, PluginArgs, PluginType};

/// User-configured subprocess plugin.
///
/// Every argv element may carry `{image}`, `{disk}`, `{serial}` and
/// `{target_id}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPluginConfig {
    pub name: String,
    pub plugin_type: PluginType,
    pub capabilities: Vec<String>,
    pub argv: Vec<String>,
}

pub struct CommandPlugin {
    config: CommandPluginConfig,
}

impl CommandPlugin {
    pub fn new(config: CommandPluginConfig) -> Self {
        Self { config }
    }

    /// Expand placeholders. Returns `None` if one has no value.
    fn expand(&self, args: &PluginArgs) -> Option<Vec<String>> {
        let image = args.image_path.as_ref().map(|p| p.to_string_lossy().into_owned());
        let disk = args
            .destination_disk
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let values = [
            ("{image}", image),
            ("{disk}", disk),
            ("{serial}", args.serial.clone()),
            ("{target_id}", args.target_id.clone()),
        ];

        self.config
            .argv
            .iter()
            .map(|arg| {
                let mut out = arg.clone();
                for (placeholder, value) in &values {
                    if out.contains(placeholder) {
                        out = out.replace(placeholder, value.as_deref()?);
                    }
                }
                Some(out)
            })
            .collect()
    }
}

impl Plugin for CommandPlugin {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn plugin_type(&self) -> PluginType {
        self.config.plugin_type
    }

    fn capabilities(&self) -> Vec<String> {
        self.config.capabilities.clone()
    }

    fn setup(&mut self) -> bool {
        !self.config.argv.is_empty() && !self.config.capabilities.is_empty()
    }

    fn execute(&self, capability: &str, args: &PluginArgs) -> bool {
        let Some(argv) = self.expand(args) else {
            warn!(plugin = %self.config.name, "Missing value for a command placeholder");
            return false;
        };
        let Some((program, rest)) = argv.split_first() else {
            return false;
        };
        debug!(plugin = %self.config.name, capability = %capability, ?argv, "Running command");
        match Command::new(program).args(rest).status() {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!(plugin = %self.config.name, %status, "Command failed");
                false
            }
            Err(e) => {
                warn!(plugin = %self.config.name, error = %e, "Command could not be started");
                false
            }
        }
    }
}
