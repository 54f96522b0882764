//! Target devices and the inventory they are loaded from.
//!
//! Discovery is external: devices come from a TOML inventory such as
//!
//! ```toml
//! [[devices]]
//! target_id = "0240000032044e45"
//! platform_name = "K64F"
//! mount_point = "/media/DAPLINK"
//! address = { kind = "serial", port = "/dev/ttyACM0", baud_rate = 115200 }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How to reach a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceAddress {
    Serial {
        port: String,
        #[serde(default)]
        baud_rate: Option<u32>,
    },
    Remote {
        /// Resource manager client registered under this name.
        client: String,
        host: String,
        port: u16,
        #[serde(default)]
        tags: Vec<String>,
    },
    Simulator {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl DeviceAddress {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceAddress::Serial { .. } => "serial",
            DeviceAddress::Remote { .. } => "remote",
            DeviceAddress::Simulator { .. } => "simulator",
        }
    }

    pub fn serial_port(&self) -> Option<&str> {
        match self {
            DeviceAddress::Serial { port, .. } => Some(port),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub target_id: String,
    pub platform_name: String,
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    pub address: DeviceAddress,
    /// Instance id of the run holding this device.
    #[serde(skip)]
    pub lock_owner: Option<String>,
}

impl Device {
    pub fn is_idle(&self) -> bool {
        self.lock_owner.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInventory {
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl DeviceInventory {
    /// Load an inventory from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading device inventory {}", path.display()))?;
        let inventory: DeviceInventory = toml::from_str(&content)
            .with_context(|| format!("parsing device inventory {}", path.display()))?;
        Ok(inventory)
    }

    /// Save the inventory to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn for_platform<'a>(&'a self, platform: &'a str) -> impl Iterator<Item = &'a Device> + 'a {
        self.devices
            .iter()
            .filter(move |d| d.platform_name.eq_ignore_ascii_case(platform))
    }
}
