use std::fs::{self, File};
use std::io;
use std::path::Path;

use tracing::{info, warn};

use super::{Plugin, PluginArgs, PluginType, wait_for_mount_point};

/// Copies the image file onto the device's mass-storage mount point.
pub struct ShellCopyPlugin;

fn copy_and_sync(image: &Path, disk: &Path) -> io::Result<u64> {
    let name = image
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "image path has no file name"))?;
    let target = disk.join(name);
    let bytes = fs::copy(image, &target)?;
    // Interface firmware only starts programming once the data hits the disk.
    File::open(&target)?.sync_all()?;
    Ok(bytes)
}

impl Plugin for ShellCopyPlugin {
    fn name(&self) -> &str {
        "shell"
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::CopyMethod
    }

    fn capabilities(&self) -> Vec<String> {
        ["default", "shell", "cp", "copy", "xcopy", "shutil"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn required_parameters(&self) -> &[&str] {
        &["image_path", "destination_disk"]
    }

    fn execute(&self, _capability: &str, args: &PluginArgs) -> bool {
        let (Some(image), Some(disk)) = (&args.image_path, &args.destination_disk) else {
            return false;
        };
        if !wait_for_mount_point(disk, args.polling_timeout) {
            return false;
        }
        match copy_and_sync(image, disk) {
            Ok(bytes) => {
                info!(image = %image.display(), disk = %disk.display(), bytes, "Image copied");
                true
            }
            Err(e) => {
                warn!(image = %image.display(), disk = %disk.display(), error = %e, "Copy failed");
                false
            }
        }
    }
}
