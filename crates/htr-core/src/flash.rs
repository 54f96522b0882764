//! Flash-and-verify.
//!
//! Copying an image onto a device is not transactional, so a zero exit code
//! from the copy plugin proves nothing. After each copy we look at what the
//! device's own filesystem says: a `FAIL.TXT` sentinel means the bootloader
//! rejected the image, and a changed `Remount count` in `DETAILS.TXT` means it
//! rebooted into something new.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::device::{Device, DeviceAddress};
use crate::events::{HtrEvent, HtrObserver, HtrPhase};
use crate::outcome::SuiteOutcome;
use crate::plugins::{PluginArgs, PluginRegistry, PluginType, wait_for_mount_point};

pub const DETAILS_FILE: &str = "DETAILS.TXT";
pub const FAIL_FILE: &str = "FAIL.TXT";

const REMOUNT_FIELD: &str = "remount count:";

/// Read-only view of the files a device exposes after reboot.
pub trait DeviceFs {
    /// Contents of `name`, matched case-insensitively.
    fn read_file(&self, name: &str) -> Option<String>;

    fn exists(&self, name: &str) -> bool {
        self.read_file(name).is_some()
    }
}

/// A device mounted as a local directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn find(&self, name: &str) -> Option<PathBuf> {
        std::fs::read_dir(&self.root)
            .ok()?
            .filter_map(Result::ok)
            .find(|entry| entry.file_name().to_string_lossy().eq_ignore_ascii_case(name))
            .map(|entry| entry.path())
    }
}

impl DeviceFs for LocalFs {
    fn read_file(&self, name: &str) -> Option<String> {
        let path = self.find(name)?;
        std::fs::read(path)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Devices without a mounted filesystem; every check reads as "unknown".
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmounted;

impl DeviceFs for Unmounted {
    fn read_file(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Extract `N` from a `Remount count: N` line.
pub fn parse_remount_count(details: &str) -> Option<u32> {
    details.lines().find_map(|line| {
        let line = line.trim();
        let head = line.get(..REMOUNT_FIELD.len())?;
        if !head.eq_ignore_ascii_case(REMOUNT_FIELD) {
            return None;
        }
        line[REMOUNT_FIELD.len()..].trim().parse().ok()
    })
}

#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// Copy plugin capability.
    pub copy_method: String,
    /// Total copy attempts; `0` behaves like `1`.
    pub retry_count: u32,
    /// Settle delay after each copy.
    pub program_cycle: Duration,
    pub verify_attempts: u32,
    pub verify_delay: Duration,
    /// Budget for the mount point to appear.
    pub polling_timeout: Duration,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            copy_method: "default".to_string(),
            retry_count: 3,
            program_cycle: Duration::from_secs(4),
            verify_attempts: 10,
            verify_delay: Duration::from_millis(500),
            polling_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("Image not found: {0}")]
    NoImage(PathBuf),

    #[error("Mount point not ready: {0}")]
    MountNotReady(PathBuf),

    #[error("Image not verified after {attempts} attempt(s)")]
    CopyFailed { attempts: u32 },
}

impl FlashError {
    /// Suite outcome a task ends with when flashing fails this way.
    pub fn outcome(&self) -> SuiteOutcome {
        match self {
            FlashError::NoImage(_) => SuiteOutcome::NoImage,
            FlashError::MountNotReady(_) => SuiteOutcome::IoerrDisk,
            FlashError::CopyFailed { .. } => SuiteOutcome::IoerrCopy,
        }
    }
}

pub struct Flasher<'a> {
    plugins: &'a PluginRegistry,
    config: FlashConfig,
    observer: Option<&'a dyn HtrObserver>,
}

impl<'a> Flasher<'a> {
    pub fn new(plugins: &'a PluginRegistry, config: FlashConfig) -> Self {
        Self {
            plugins,
            config,
            observer: None,
        }
    }

    /// Report the verification phase to `observer`.
    pub fn with_observer(mut self, observer: &'a dyn HtrObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn copy_image(&self, image: &Path, device: &Device) -> bool {
        match self.try_copy_image(image, device) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Flashing failed");
                false
            }
        }
    }

    /// Flash `image` onto `device` and confirm it took.
    #[instrument(skip(self, device), fields(target_id = %device.target_id))]
    pub fn try_copy_image(&self, image: &Path, device: &Device) -> Result<(), FlashError> {
        if !image.is_file() {
            return Err(FlashError::NoImage(image.to_path_buf()));
        }

        let baud_rate = match &device.address {
            DeviceAddress::Serial { baud_rate, .. } => *baud_rate,
            _ => None,
        };
        let args = PluginArgs {
            image_path: Some(image.to_path_buf()),
            destination_disk: device.mount_point.clone(),
            serial: device.address.serial_port().map(str::to_string),
            baud_rate,
            target_id: Some(device.target_id.clone()),
            polling_timeout: self.config.polling_timeout,
        };

        match &device.mount_point {
            Some(mount) => {
                if !wait_for_mount_point(mount, self.config.polling_timeout) {
                    return Err(FlashError::MountNotReady(mount.clone()));
                }
                self.copy_image_with(&args, &LocalFs::new(mount))
            }
            None => self.copy_image_with(&args, &Unmounted),
        }
    }

    /// The retry loop proper, against any device filesystem view.
    pub fn copy_image_with(&self, args: &PluginArgs, fs: &dyn DeviceFs) -> Result<(), FlashError> {
        let attempts = self.config.retry_count.max(1);
        for attempt in 1..=attempts {
            let baseline = fs.read_file(DETAILS_FILE).and_then(|t| parse_remount_count(&t));
            debug!(attempt, ?baseline, "Remount baseline");

            let copied = self
                .plugins
                .try_call(PluginType::CopyMethod, &self.config.copy_method, args);
            thread::sleep(self.config.program_cycle);
            if !copied {
                warn!(attempt, method = %self.config.copy_method, "Copy plugin failed");
                continue;
            }

            if let Some(observer) = self.observer {
                observer.on_event(&HtrEvent::PhaseChanged {
                    target_id: args.target_id.clone().unwrap_or_default(),
                    phase: HtrPhase::Verifying,
                });
            }
            if self.verify(fs, baseline) {
                info!(attempt, "Image flashed and verified");
                return Ok(());
            }
            warn!(attempt, "Flash verification failed");
        }
        Err(FlashError::CopyFailed { attempts })
    }

    fn verify(&self, fs: &dyn DeviceFs, baseline: Option<u32>) -> bool {
        for poll in 0..self.config.verify_attempts.max(1) {
            if poll > 0 {
                thread::sleep(self.config.verify_delay);
            }
            if let Some(contents) = fs.read_file(FAIL_FILE) {
                error!(contents = %contents.trim(), "Device reported a flash failure");
                return false;
            }
            let Some(before) = baseline else {
                // Remount count unavailable, only the sentinel can be checked.
                return true;
            };
            match fs.read_file(DETAILS_FILE).and_then(|t| parse_remount_count(&t)) {
                Some(now) if now != before => {
                    debug!(before, now, "Remount count changed");
                    return true;
                }
                _ => {}
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::tests::FlakyCopy;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeFs {
        files: HashMap<String, String>,
        /// When set, every DETAILS read reports a fresh remount count.
        remount: Option<Mutex<u32>>,
    }

    impl DeviceFs for FakeFs {
        fn read_file(&self, name: &str) -> Option<String> {
            if name == DETAILS_FILE {
                if let Some(counter) = &self.remount {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    return Some(format!("Version: 0254\nRemount count: {}\n", *n));
                }
            }
            self.files.get(name).cloned()
        }
    }

    fn quick(retry_count: u32) -> FlashConfig {
        FlashConfig {
            copy_method: "flaky".into(),
            retry_count,
            program_cycle: Duration::ZERO,
            verify_attempts: 3,
            verify_delay: Duration::ZERO,
            polling_timeout: Duration::ZERO,
        }
    }

    fn registry(fail_first: usize) -> (PluginRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = PluginRegistry::new();
        reg.register(Box::new(FlakyCopy { calls: calls.clone(), fail_first }))
            .unwrap();
        (reg, calls)
    }

    #[test]
    fn test_parse_remount_count() {
        let details = "# DAPLink Firmware\nUnique ID: 0240\nRemount count: 7\n";
        assert_eq!(parse_remount_count(details), Some(7));
        assert_eq!(parse_remount_count("remount COUNT:  12"), Some(12));
        assert_eq!(parse_remount_count("Version: 0254"), None);
        assert_eq!(parse_remount_count("Remount count: lots"), None);
    }

    #[test]
    fn test_retries_until_copy_succeeds() {
        let (reg, calls) = registry(2);
        let flasher = Flasher::new(&reg, quick(4));
        assert!(flasher.copy_image_with(&PluginArgs::default(), &FakeFs::default()).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_gives_up_after_retry_count() {
        let (reg, calls) = registry(5);
        let flasher = Flasher::new(&reg, quick(3));
        let err = flasher
            .copy_image_with(&PluginArgs::default(), &FakeFs::default())
            .unwrap_err();
        assert_eq!(err, FlashError::CopyFailed { attempts: 3 });
        assert_eq!(err.outcome(), SuiteOutcome::IoerrCopy);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_retry_count_still_tries_once() {
        let (reg, calls) = registry(0);
        let flasher = Flasher::new(&reg, quick(0));
        assert!(flasher.copy_image_with(&PluginArgs::default(), &FakeFs::default()).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fail_sentinel_fails_verification() {
        let (reg, calls) = registry(0);
        let mut fs = FakeFs::default();
        fs.files.insert(FAIL_FILE.into(), "error: The transfer timed out.\n".into());
        let flasher = Flasher::new(&reg, quick(2));
        assert!(flasher.copy_image_with(&PluginArgs::default(), &fs).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unchanged_remount_count_fails() {
        let (reg, _) = registry(0);
        let mut fs = FakeFs::default();
        fs.files.insert(DETAILS_FILE.into(), "Remount count: 3\n".into());
        let flasher = Flasher::new(&reg, quick(1));
        assert!(flasher.copy_image_with(&PluginArgs::default(), &fs).is_err());
    }

    #[test]
    fn test_changed_remount_count_passes() {
        let (reg, _) = registry(0);
        let fs = FakeFs {
            remount: Some(Mutex::new(0)),
            ..Default::default()
        };
        let flasher = Flasher::new(&reg, quick(1));
        assert!(flasher.copy_image_with(&PluginArgs::default(), &fs).is_ok());
    }

    #[test]
    fn test_verifying_phase_reported_per_copy() {
        use crate::events::tests::RecordingObserver;

        let (reg, _) = registry(1);
        let observer = RecordingObserver::default();
        let flasher = Flasher::new(&reg, quick(3)).with_observer(&observer);
        let args = PluginArgs {
            target_id: Some("0240".into()),
            ..PluginArgs::default()
        };
        assert!(flasher.copy_image_with(&args, &FakeFs::default()).is_ok());

        // The failed copy never reaches verification.
        let events = observer.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            HtrEvent::PhaseChanged { target_id, phase: HtrPhase::Verifying } if target_id == "0240"
        ));
    }

    #[test]
    fn test_local_fs_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("details.txt"), "Remount count: 4\n").unwrap();
        let fs = LocalFs::new(dir.path());
        assert!(fs.exists(DETAILS_FILE));
        assert!(!fs.exists(FAIL_FILE));
        assert_eq!(
            fs.read_file(DETAILS_FILE).and_then(|t| parse_remount_count(&t)),
            Some(4)
        );
    }

    #[test]
    fn test_missing_image() {
        let (reg, calls) = registry(0);
        let flasher = Flasher::new(&reg, quick(1));
        let device = Device {
            target_id: "t".into(),
            platform_name: "K64F".into(),
            mount_point: None,
            address: DeviceAddress::Serial {
                port: "/dev/null".into(),
                baud_rate: None,
            },
            lock_owner: None,
        };
        let err = flasher
            .try_copy_image(Path::new("/no/such/image.bin"), &device)
            .unwrap_err();
        assert_eq!(err.outcome(), SuiteOutcome::NoImage);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
