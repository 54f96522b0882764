use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use super::{Plugin, PluginArgs, PluginType};

const DEFAULT_BAUD: u32 = 9600;

/// Resets the DUT by holding a break condition on its serial line.
pub struct SerialResetPlugin {
    break_duration: Duration,
}

impl Default for SerialResetPlugin {
    fn default() -> Self {
        Self {
            break_duration: Duration::from_millis(100),
        }
    }
}

impl Plugin for SerialResetPlugin {
    fn name(&self) -> &str {
        "serial"
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::ResetMethod
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["default".into(), "serial".into()]
    }

    fn required_parameters(&self) -> &[&str] {
        &["serial"]
    }

    fn execute(&self, _capability: &str, args: &PluginArgs) -> bool {
        let Some(port_name) = &args.serial else {
            return false;
        };
        let baud = args.baud_rate.unwrap_or(DEFAULT_BAUD);
        let result = serialport::new(port_name, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .and_then(|port| {
                port.set_break()?;
                thread::sleep(self.break_duration);
                port.clear_break()
            });
        match result {
            Ok(()) => {
                info!(port = %port_name, "Serial break reset sent");
                true
            }
            Err(e) => {
                warn!(port = %port_name, error = %e, "Serial break reset failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_missing_port_fails() {
        let args = PluginArgs {
            serial: Some("/dev/htr-does-not-exist".into()),
            ..Default::default()
        };
        assert!(!SerialResetPlugin::default().execute("default", &args));
    }
}
