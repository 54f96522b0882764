//! Firmware images and the tasks built from them.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A bootable binary produced by the (external) build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareImage {
    pub path: PathBuf,
    /// Name of the test binary that owns the image.
    pub test_name: String,
    #[serde(default)]
    pub compare_log: Option<PathBuf>,
}

/// One image paired with the constraints it runs under.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionTask {
    pub build: String,
    pub image: FirmwareImage,
    pub copy_method: String,
    pub reset_method: String,
    pub program_cycle: Duration,
    pub sync_packets: u32,
    pub tags: Vec<String>,
    /// Directory coverage dumps and relative artefacts land in.
    pub build_path: Option<PathBuf>,
    pub baud_rate: Option<u32>,
}

/// All tasks for one build, with the platform its devices must match.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTarget {
    pub name: String,
    pub platform: String,
    pub tasks: Vec<ExecutionTask>,
}
