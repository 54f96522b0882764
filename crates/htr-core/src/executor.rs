//! Running one task on one device: flash, connect, supervise, decode.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::config::RunConfig;
use crate::decoder::{DecodeOptions, decode, unmatched_reference_line};
use crate::device::{Device, DeviceAddress};
use crate::events::{HtrEvent, HtrObserver, HtrPhase, TracingObserver};
use crate::flash::{FlashConfig, Flasher};
use crate::host_tests::HostTestRegistry;
use crate::outcome::{SuiteOutcome, SuiteResult};
use crate::plugins::{PluginArgs, PluginRegistry, PluginType};
use crate::protocol::constants::KEY_RESULT;
use crate::protocol::kv::frame;
use crate::protocol::transcript::{Direction, Transcript};
use crate::session::HostTestSession;
use crate::task::ExecutionTask;
use crate::transport::serial::wait_for_port;
use crate::transport::{
    ClientRegistry, Connector, RemoteConfig, RemoteConnector, SerialConfig, SerialConnector,
    SimulatorConfig, SimulatorConnector,
};

pub const DEFAULT_BAUD_RATE: u32 = 9600;
const DEFAULT_RESET_METHOD: &str = "default";
const EXEC_TAG: &str = "EXEC";

/// Runs a single execution attempt of a task on a device the caller owns.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &ExecutionTask, device: &Device, cancel: &CancellationToken)
    -> SuiteResult;
}

/// The real executor: flash-and-verify, open the device's transport, run a
/// host-test session and decode its transcript.
pub struct HostTestExecutor<O: HtrObserver = TracingObserver> {
    config: RunConfig,
    plugins: PluginRegistry,
    host_tests: HostTestRegistry,
    clients: ClientRegistry,
    observer: Arc<O>,
}

impl HostTestExecutor<TracingObserver> {
    pub fn new(config: RunConfig, plugins: PluginRegistry) -> Self {
        Self::with_observer(config, plugins, Arc::new(TracingObserver))
    }
}

impl<O: HtrObserver> HostTestExecutor<O> {
    pub fn with_observer(config: RunConfig, plugins: PluginRegistry, observer: Arc<O>) -> Self {
        Self {
            config,
            plugins,
            host_tests: HostTestRegistry::with_builtins(),
            clients: ClientRegistry::new(),
            observer,
        }
    }

    /// Host tests the DUT may select with `__host_test_name`.
    pub fn host_tests_mut(&mut self) -> &mut HostTestRegistry {
        &mut self.host_tests
    }

    /// Resource manager clients available to remote devices.
    pub fn clients_mut(&mut self) -> &mut ClientRegistry {
        &mut self.clients
    }

    fn phase(&self, target_id: &str, phase: HtrPhase) {
        self.observer.on_event(&HtrEvent::PhaseChanged {
            target_id: target_id.to_string(),
            phase,
        });
    }

    /// Bring the device to the point where a session can start.
    fn connect(
        &self,
        task: &ExecutionTask,
        device: &Device,
    ) -> Result<Box<dyn Connector>, SuiteOutcome> {
        if !task.image.path.is_file() {
            warn!(image = %task.image.path.display(), "Image not found");
            return Err(SuiteOutcome::NoImage);
        }

        match &device.address {
            DeviceAddress::Serial { port, baud_rate } => {
                self.phase(&device.target_id, HtrPhase::Flashing);
                let flash = FlashConfig {
                    program_cycle: task.program_cycle,
                    ..self.config.flash_config(&task.copy_method)
                };
                let flasher = Flasher::new(&self.plugins, flash).with_observer(&*self.observer);
                if let Err(e) = flasher.try_copy_image(&task.image.path, device) {
                    warn!(error = %e, "Flashing failed");
                    return Err(e.outcome());
                }

                self.phase(&device.target_id, HtrPhase::Connecting);
                if !wait_for_port(port, self.config.polling_timeout()) {
                    return Err(SuiteOutcome::IoerrSerial);
                }
                let plugin_reset = task.reset_method != DEFAULT_RESET_METHOD
                    && self.plugins.has(PluginType::ResetMethod, &task.reset_method);
                let baud = task.baud_rate.or(*baud_rate).unwrap_or(DEFAULT_BAUD_RATE);
                let serial = SerialConfig {
                    polling_timeout: self.config.polling_timeout(),
                    forced_reset_timeout: self.config.forced_reset_timeout(),
                    skip_reset: plugin_reset,
                    ..SerialConfig::new(port.clone(), baud)
                };
                let connector = SerialConnector::open(serial).map_err(|e| {
                    warn!(error = %e, "Cannot open serial port");
                    SuiteOutcome::IoerrSerial
                })?;

                if plugin_reset {
                    let args = PluginArgs {
                        serial: Some(port.clone()),
                        baud_rate: Some(baud),
                        target_id: Some(device.target_id.clone()),
                        polling_timeout: self.config.polling_timeout(),
                        ..PluginArgs::default()
                    };
                    if !self
                        .plugins
                        .try_call(PluginType::ResetMethod, &task.reset_method, &args)
                    {
                        warn!(method = %task.reset_method, "Reset plugin failed");
                    }
                }
                Ok(Box::new(connector))
            }
            DeviceAddress::Remote {
                client,
                host,
                port,
                tags,
            } => {
                self.phase(&device.target_id, HtrPhase::Flashing);
                let mut all_tags = tags.clone();
                all_tags.extend(task.tags.iter().cloned());
                let remote = RemoteConfig {
                    client: client.clone(),
                    host: host.clone(),
                    port: *port,
                    platform_name: device.platform_name.clone(),
                    tags: all_tags,
                    baud_rate: task.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
                    image: Some(task.image.path.clone()),
                    forced_reset_timeout: self.config.forced_reset_timeout(),
                };
                let connector = RemoteConnector::open(&self.clients, remote).map_err(|e| {
                    warn!(error = %e, "Remote device unavailable");
                    SuiteOutcome::IoerrSerial
                })?;
                Ok(Box::new(connector))
            }
            DeviceAddress::Simulator { command, args } => {
                self.phase(&device.target_id, HtrPhase::Connecting);
                let sim = SimulatorConfig {
                    command: command.clone(),
                    args: args.clone(),
                    image: task.image.path.clone(),
                };
                let connector = SimulatorConnector::open(sim).map_err(|e| {
                    warn!(error = %e, "Cannot start simulator");
                    SuiteOutcome::IoerrSerial
                })?;
                Ok(Box::new(connector))
            }
        }
    }

    fn decode_options(&self, task: &ExecutionTask, duration: Option<f64>) -> DecodeOptions {
        DecodeOptions {
            test_name: task.image.test_name.clone(),
            build_path: task.build_path.clone(),
            duration,
        }
    }

    /// Result for a task that never reached a session.
    fn early_result(&self, task: &ExecutionTask, outcome: SuiteOutcome, reason: &str) -> SuiteResult {
        let mut transcript = Transcript::new();
        transcript.push(EXEC_TAG, Direction::Inf, reason);
        transcript.push(
            EXEC_TAG,
            Direction::Rxd,
            frame(KEY_RESULT, outcome.marker()).trim_end(),
        );
        decode(&transcript, self.decode_options(task, Some(0.0)))
    }
}

/// Fail a passing suite whose output does not follow the reference log.
fn check_reference_log(result: &mut SuiteResult, transcript: &Transcript, reference: &Path) {
    let expected = match fs::read_to_string(reference) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %reference.display(), error = %e, "Cannot read reference log");
            return;
        }
    };
    if let Some(line) = unmatched_reference_line(transcript, &expected) {
        warn!(path = %reference.display(), line = %line, "Output does not match reference log");
        if result.outcome == SuiteOutcome::Ok {
            result.outcome = SuiteOutcome::Fail;
        }
    }
}

impl<O: HtrObserver> TaskExecutor for HostTestExecutor<O> {
    #[instrument(skip_all, fields(target_id = %device.target_id, test = %task.image.test_name))]
    fn execute(
        &self,
        task: &ExecutionTask,
        device: &Device,
        cancel: &CancellationToken,
    ) -> SuiteResult {
        let result = if cancel.is_cancelled() {
            self.early_result(task, SuiteOutcome::Error, "Run cancelled")
        } else {
            match self.connect(task, device) {
                Err(outcome) => {
                    let reason = format!("Device not ready: {}", outcome);
                    self.early_result(task, outcome, &reason)
                }
                Ok(connector) => {
                    let session = HostTestSession::with_observer(
                        connector,
                        self.config.session_config(&device.target_id, task.sync_packets),
                        &self.host_tests,
                        cancel.clone(),
                        self.observer.clone(),
                    )
                    .run();

                    self.phase(&device.target_id, HtrPhase::Decoding);
                    let mut result = decode(
                        &session.transcript,
                        self.decode_options(task, Some(session.duration)),
                    );
                    if let Some(reference) = &task.image.compare_log {
                        check_reference_log(&mut result, &session.transcript, reference);
                    }
                    result
                }
            }
        };

        info!(outcome = %result.outcome, cases = result.test_cases.len(), "Task finished");
        self.observer.on_event(&HtrEvent::SuiteComplete {
            target_id: device.target_id.clone(),
            test_name: task.image.test_name.clone(),
            outcome: result.outcome,
            duration: result.duration,
        });
        self.phase(&device.target_id, HtrPhase::Complete);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::RecordingObserver;
    use crate::task::FirmwareImage;
    use std::path::PathBuf;
    use std::time::Duration;

    fn task(image: PathBuf) -> ExecutionTask {
        ExecutionTask {
            build: "K64F-GCC".into(),
            image: FirmwareImage {
                path: image,
                test_name: "mbed-drivers-test-ticker".into(),
                compare_log: None,
            },
            copy_method: "default".into(),
            reset_method: "default".into(),
            program_cycle: Duration::ZERO,
            sync_packets: 1,
            tags: Vec::new(),
            build_path: None,
            baud_rate: None,
        }
    }

    fn serial_device(mount: Option<PathBuf>) -> Device {
        Device {
            target_id: "0240".into(),
            platform_name: "K64F".into(),
            mount_point: mount,
            address: DeviceAddress::Serial {
                port: "/dev/htr-does-not-exist".into(),
                baud_rate: None,
            },
            lock_owner: None,
        }
    }

    fn executor() -> HostTestExecutor<RecordingObserver> {
        let config = RunConfig {
            polling_timeout_secs: 0,
            program_cycle_ms: 0,
            verify_delay_ms: 0,
            ..RunConfig::default()
        };
        HostTestExecutor::with_observer(
            config,
            PluginRegistry::with_builtins(),
            Arc::new(RecordingObserver::default()),
        )
    }

    #[test]
    fn test_missing_image_is_no_image() {
        let exec = executor();
        let result = exec.execute(
            &task(PathBuf::from("/no/such/image.bin")),
            &serial_device(None),
            &CancellationToken::new(),
        );
        assert_eq!(result.outcome, SuiteOutcome::NoImage);
        // The synthesized case still gives the run a case record.
        assert_eq!(result.test_cases.len(), 1);
        assert!(result.test_cases.contains_key("ticker"));

        let events = exec.observer.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            HtrEvent::SuiteComplete {
                outcome: SuiteOutcome::NoImage,
                ..
            }
        )));
    }

    #[test]
    fn test_missing_mount_point_is_ioerr_disk() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("ticker.bin");
        std::fs::write(&image, b"\x7fELF").unwrap();
        let result = executor().execute(
            &task(image),
            &serial_device(Some(dir.path().join("DAPLINK"))),
            &CancellationToken::new(),
        );
        assert_eq!(result.outcome, SuiteOutcome::IoerrDisk);
    }

    #[test]
    fn test_missing_serial_port_is_ioerr_serial() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("ticker.bin");
        std::fs::write(&image, b"\x7fELF").unwrap();
        let mount = dir.path().join("DAPLINK");
        std::fs::create_dir(&mount).unwrap();

        let result = executor().execute(
            &task(image),
            &serial_device(Some(mount.clone())),
            &CancellationToken::new(),
        );
        assert_eq!(result.outcome, SuiteOutcome::IoerrSerial);
        // The shell copy plugin put the image on the "device".
        assert!(mount.join("ticker.bin").is_file());
    }

    #[test]
    fn test_unknown_remote_client_is_ioerr_serial() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("ticker.bin");
        std::fs::write(&image, b"\x7fELF").unwrap();
        let device = Device {
            address: DeviceAddress::Remote {
                client: "nope".into(),
                host: "127.0.0.1".into(),
                port: 1,
                tags: Vec::new(),
            },
            ..serial_device(None)
        };
        let result = executor().execute(&task(image), &device, &CancellationToken::new());
        assert_eq!(result.outcome, SuiteOutcome::IoerrSerial);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = executor().execute(
            &task(PathBuf::from("/no/such/image.bin")),
            &serial_device(None),
            &cancel,
        );
        assert_eq!(result.outcome, SuiteOutcome::Error);
    }

    #[cfg(unix)]
    fn run_on_simulator(compare_log: Option<PathBuf>) -> SuiteResult {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("hello.elf");
        std::fs::write(&image, b"\x7fELF").unwrap();
        let mut task = task(image);
        task.sync_packets = 0;
        task.image.compare_log = compare_log;
        let device = Device {
            address: DeviceAddress::Simulator {
                command: "sh".into(),
                args: vec![
                    "-c".into(),
                    "echo 'boot {image}'; echo 'all good'; echo '{{end;success}}'".into(),
                ],
            },
            ..serial_device(None)
        };
        executor().execute(&task, &device, &CancellationToken::new())
    }

    #[cfg(unix)]
    #[test]
    fn test_simulator_run_passes() {
        assert_eq!(run_on_simulator(None).outcome, SuiteOutcome::Ok);
    }

    #[cfg(unix)]
    #[test]
    fn test_reference_log_mismatch_fails_suite() {
        let dir = tempfile::tempdir().unwrap();
        let matching = dir.path().join("match.log");
        std::fs::write(&matching, "boot\nall good\n").unwrap();
        assert_eq!(run_on_simulator(Some(matching)).outcome, SuiteOutcome::Ok);

        let diverging = dir.path().join("diverge.log");
        std::fs::write(&diverging, "all good\nboot\n").unwrap();
        assert_eq!(run_on_simulator(Some(diverging)).outcome, SuiteOutcome::Fail);
    }

    #[test]
    fn test_unreadable_reference_log_is_ignored() {
        let mut result = SuiteResult::new(SuiteOutcome::Ok);
        check_reference_log(
            &mut result,
            &Transcript::new(),
            Path::new("/no/such/reference.log"),
        );
        assert_eq!(result.outcome, SuiteOutcome::Ok);
    }
}
