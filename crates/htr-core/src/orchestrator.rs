//! Multi-device orchestration.
//!
//! For every build target the orchestrator picks up to `parallelism` idle
//! devices of the right platform, puts the build's tasks on one shared queue
//! and starts one worker thread per device. Workers push their partial
//! reports over a channel; the coordinator polls that channel with a short
//! timeout so cancellation stays responsive, merges the partials and only then
//! moves on to the next build.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::RunConfig;
use crate::device::{Device, DeviceInventory};
use crate::executor::TaskExecutor;
use crate::lock::Kettle;
use crate::outcome::{SuiteOutcome, SuiteResult};
use crate::report::{PartialReport, SuiteReport, TestReport};
use crate::task::{BuildTarget, ExecutionTask};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Devices picked for one build.
enum Selection {
    Devices(Vec<Device>),
    /// Devices of the platform exist but every one is in use.
    Busy,
    /// The inventory has no device of the platform.
    NoMatch,
}

/// What one worker sends back when its queue runs dry.
struct WorkerReport {
    target_id: String,
    partial: PartialReport,
    executed: usize,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub report: TestReport,
    pub cancelled: bool,
}

impl RunSummary {
    /// `0` when every suite passed and every platform found a device.
    pub fn exit_code(&self) -> i32 {
        if !self.report.unmatched_platforms.is_empty() {
            2
        } else if self.cancelled || !self.report.suite_outcome().is_success() {
            1
        } else {
            0
        }
    }
}

pub struct Orchestrator<E: TaskExecutor + 'static> {
    config: RunConfig,
    executor: Arc<E>,
    cancel: CancellationToken,
    kettle: Option<Kettle>,
    instance_id: String,
}

impl<E: TaskExecutor + 'static> Orchestrator<E> {
    pub fn new(config: RunConfig, executor: E, cancel: CancellationToken) -> Self {
        Self {
            config,
            executor: Arc::new(executor),
            cancel,
            kettle: None,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Claim devices through `kettle` before using them.
    pub fn with_kettle(mut self, kettle: Kettle) -> Self {
        self.instance_id = kettle.instance_id().to_string();
        self.kettle = Some(kettle);
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Run every build target in order.
    #[instrument(skip_all, fields(builds = targets.len()))]
    pub fn run(&self, targets: &[BuildTarget], inventory: &mut DeviceInventory) -> RunSummary {
        let seed = self
            .config
            .shuffle
            .then(|| self.config.shuffle_seed.unwrap_or_else(rand::random));
        if let Some(seed) = seed {
            info!(seed, "Shuffling test order");
        }
        let mut report = TestReport::new(seed);

        for target in targets {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled, skipping remaining builds");
                break;
            }
            if target.tasks.is_empty() {
                debug!(build = %target.name, "No tests to run");
                continue;
            }

            let selected = match self.select_devices(target, inventory) {
                Selection::Devices(selected) => selected,
                Selection::Busy => {
                    warn!(build = %target.name, platform = %target.platform, "Every device of the platform is busy");
                    let reason = format!("every {} device is held by another instance", target.platform);
                    for task in &target.tasks {
                        report.insert_not_executed(task, &target.platform, &reason);
                    }
                    if !report.busy_platforms.contains(&target.platform) {
                        report.busy_platforms.push(target.platform.clone());
                    }
                    continue;
                }
                Selection::NoMatch => {
                    error!(build = %target.name, platform = %target.platform, "No device matches platform");
                    if !report.unmatched_platforms.contains(&target.platform) {
                        report.unmatched_platforms.push(target.platform.clone());
                    }
                    continue;
                }
            };

            let partial = self.run_build(target, &selected, seed);
            report.merge(partial);
            self.release_devices(&selected, inventory);
        }

        RunSummary {
            report,
            cancelled: self.cancel.is_cancelled(),
        }
    }

    /// Up to `parallelism` idle devices of the build's platform, claimed in
    /// the kettle when locking is on. Contended devices are skipped.
    fn select_devices(&self, target: &BuildTarget, inventory: &mut DeviceInventory) -> Selection {
        let wanted = self.config.parallelism.max(1);
        let mut selected = Vec::new();
        let mut matching = 0;
        for device in inventory.devices.iter_mut() {
            if selected.len() == wanted {
                break;
            }
            if !device.platform_name.eq_ignore_ascii_case(&target.platform) {
                continue;
            }
            matching += 1;
            if !device.is_idle() {
                continue;
            }
            if let Some(kettle) = &self.kettle {
                match kettle.acquire(&device.target_id) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(target_id = %device.target_id, "Device held by another instance");
                        continue;
                    }
                    Err(e) => {
                        warn!(target_id = %device.target_id, error = %e, "Cannot lock device");
                        continue;
                    }
                }
            }
            device.lock_owner = Some(self.instance_id.clone());
            selected.push(device.clone());
        }
        info!(
            build = %target.name,
            platform = %target.platform,
            devices = selected.len(),
            "Devices selected"
        );
        if !selected.is_empty() {
            Selection::Devices(selected)
        } else if matching > 0 {
            Selection::Busy
        } else {
            Selection::NoMatch
        }
    }

    fn release_devices(&self, selected: &[Device], inventory: &mut DeviceInventory) {
        for device in selected {
            if let Some(kettle) = &self.kettle {
                if let Err(e) = kettle.release(&device.target_id) {
                    warn!(target_id = %device.target_id, error = %e, "Cannot release device lock");
                }
            }
            if let Some(entry) = inventory
                .devices
                .iter_mut()
                .find(|d| d.target_id == device.target_id)
            {
                entry.lock_owner = None;
            }
        }
    }

    #[instrument(skip_all, fields(build = %target.name))]
    fn run_build(&self, target: &BuildTarget, devices: &[Device], seed: Option<u64>) -> PartialReport {
        let mut tasks = target.tasks.clone();
        if let Some(seed) = seed {
            tasks.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        for task in tasks {
            // The receiver is alive, so this cannot fail.
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let (result_tx, result_rx) = crossbeam_channel::bounded(devices.len());
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for device in devices {
            let worker = Worker {
                executor: self.executor.clone(),
                device: device.clone(),
                queue: task_rx.clone(),
                results: result_tx.clone(),
                cancel: self.cancel.clone(),
                retry_count: self.config.retry_count.max(1),
            };
            match thread::Builder::new()
                .name(format!("htr-worker-{}", device.target_id))
                .spawn(move || worker.run())
            {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(target_id = %device.target_id, error = %e, "Cannot start worker"),
            }
        }
        drop(result_tx);

        let mut partial = PartialReport::new();
        let mut cancel_logged = false;
        loop {
            match result_rx.recv_timeout(POLL_INTERVAL) {
                Ok(report) => {
                    debug!(target_id = %report.target_id, executed = report.executed, "Worker finished");
                    merge_into(&mut partial, report.partial);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.cancel.is_cancelled() && !cancel_logged {
                warn!("Cancellation requested, waiting for workers to finish their current task");
                cancel_logged = true;
            }
            let (done, running): (Vec<_>, Vec<_>) =
                handles.into_iter().partition(JoinHandle::is_finished);
            handles = running;
            join_all(done);
        }
        join_all(handles);

        // Whatever is still queued was never run: cancelled, or every worker died.
        for task in task_rx.try_iter() {
            warn!(test = %task.image.test_name, "Test not executed");
            let mut result = SuiteResult::new(SuiteOutcome::Error);
            result.raw_output = "Test was not executed".to_string();
            let report = SuiteReport::from_result(
                result,
                &target.platform,
                "",
                &task.copy_method,
                task.image.path.clone(),
                0,
            );
            partial
                .entry(task.build.clone())
                .or_default()
                .insert(task.image.test_name.clone(), report);
        }
        partial
    }
}

fn merge_into(into: &mut PartialReport, partial: PartialReport) {
    for (build, suites) in partial {
        into.entry(build).or_default().extend(suites);
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            error!("Worker thread panicked");
        }
    }
}

/// One device's consumer of the shared task queue.
struct Worker<E: TaskExecutor> {
    executor: Arc<E>,
    device: Device,
    queue: Receiver<ExecutionTask>,
    results: Sender<WorkerReport>,
    cancel: CancellationToken,
    retry_count: u32,
}

impl<E: TaskExecutor> Worker<E> {
    #[instrument(skip_all, fields(target_id = %self.device.target_id))]
    fn run(self) {
        let mut partial = PartialReport::new();
        let mut executed = 0;

        while !self.cancel.is_cancelled() {
            let Ok(task) = self.queue.try_recv() else {
                break;
            };
            executed += 1;
            let (result, attempts, panicked) = self.run_with_retry(&task);
            let report = SuiteReport::from_result(
                result,
                &self.device.platform_name,
                &self.device.target_id,
                &task.copy_method,
                task.image.path.clone(),
                attempts,
            );
            partial
                .entry(task.build.clone())
                .or_default()
                .insert(task.image.test_name.clone(), report);
            if panicked {
                // The device is in an unknown state; leave the rest to others.
                break;
            }
        }

        let report = WorkerReport {
            target_id: self.device.target_id.clone(),
            partial,
            executed,
        };
        if self.results.send(report).is_err() {
            warn!("Coordinator gone, dropping worker results");
        }
    }

    fn run_with_retry(&self, task: &ExecutionTask) -> (SuiteResult, u32, bool) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let run = catch_unwind(AssertUnwindSafe(|| {
                self.executor.execute(task, &self.device, &self.cancel)
            }));
            let result = match run {
                Ok(result) => result,
                Err(_) => {
                    error!(test = %task.image.test_name, "Executor panicked");
                    let mut result = SuiteResult::new(SuiteOutcome::Error);
                    result.raw_output = "Executor panicked".to_string();
                    return (result, attempt, true);
                }
            };
            if result.outcome.is_success() || attempt >= self.retry_count || self.cancel.is_cancelled()
            {
                return (result, attempt, false);
            }
            info!(
                test = %task.image.test_name,
                outcome = %result.outcome,
                attempt,
                "Retrying test"
            );
        }
    }
}
