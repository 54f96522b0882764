//! Local simulator backend.
//!
//! Runs a target-simulation process with the image loaded and exposes its
//! stdin/stdout as the DUT byte stream.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use tracing::{debug, info, warn};

use super::traits::{Connector, TransportError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Simulator executable.
    pub command: String,
    /// Arguments; `{image}` is replaced with the image path.
    pub args: Vec<String>,
    pub image: PathBuf,
}

impl SimulatorConfig {
    fn expanded_args(&self) -> Vec<String> {
        let image = self.image.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{image}", &image))
            .collect()
    }
}

/// Running simulator process with its stdout pumped into a channel.
struct SimProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<Vec<u8>>,
}

impl SimProcess {
    fn spawn(config: &SimulatorConfig) -> Result<Self, TransportError> {
        let mut child = Command::new(&config.command)
            .args(config.expanded_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TransportError::OpenFailed {
                resource: config.command.clone(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take().ok_or_else(|| TransportError::OpenFailed {
            resource: config.command.clone(),
            message: "stdout not captured".into(),
        })?;

        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("htr-sim-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            child,
            stdin,
            output: rx,
        })
    }

    fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            _ => None,
        }
    }

    fn shutdown(mut self) {
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct SimulatorConnector {
    config: SimulatorConfig,
    process: Option<SimProcess>,
    last_error: Option<TransportError>,
}

impl SimulatorConnector {
    /// Start the simulator with the image loaded.
    pub fn open(config: SimulatorConfig) -> Result<Self, TransportError> {
        let process = SimProcess::spawn(&config)?;
        info!(command = %config.command, image = %config.image.display(), "Simulator started");
        Ok(Self {
            config,
            process: Some(process),
            last_error: None,
        })
    }
}

impl Connector for SimulatorConnector {
    fn name(&self) -> &str {
        "SIM"
    }

    fn read(&mut self, max_bytes: usize) -> Vec<u8> {
        let Some(process) = self.process.as_mut() else {
            return Vec::new();
        };
        let mut data = match process.output.recv_timeout(POLL_INTERVAL) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => return Vec::new(),
            // The reader only hangs up once stdout is closed and drained.
            Err(RecvTimeoutError::Disconnected) => {
                let status = process.exit_status();
                debug!(command = %self.config.command, status = ?status, "Simulator output closed");
                self.fail(TransportError::Disconnected);
                return Vec::new();
            }
        };
        while data.len() < max_bytes {
            match process.output.try_recv() {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }
        data
    }

    fn write(&mut self, payload: &[u8], log_it: bool) -> bool {
        let Some(stdin) = self.process.as_mut().and_then(|p| p.stdin.as_mut()) else {
            return false;
        };
        match stdin.write_all(payload).and_then(|_| stdin.flush()) {
            Ok(()) => {
                if log_it {
                    debug!(data = %String::from_utf8_lossy(payload).trim_end(), "Simulator write");
                }
                true
            }
            Err(e) => {
                self.fail(TransportError::WriteFailed(e.to_string()));
                false
            }
        }
    }

    fn flush(&mut self) {
        if let Some(process) = self.process.as_mut() {
            while process.output.try_recv().is_ok() {}
        }
    }

    /// Restart the simulator process with the same image.
    fn reset(&mut self) -> bool {
        if let Some(process) = self.process.take() {
            process.shutdown();
        }
        match SimProcess::spawn(&self.config) {
            Ok(process) => {
                self.process = Some(process);
                true
            }
            Err(e) => {
                self.last_error = Some(e);
                false
            }
        }
    }

    fn connected(&self) -> bool {
        self.process.is_some()
    }

    fn last_error(&self) -> Option<TransportError> {
        self.last_error.clone()
    }

    fn close(&mut self) {
        if let Some(process) = self.process.take() {
            debug!(command = %self.config.command, "Shutting down simulator");
            process.shutdown();
        }
    }
}

impl SimulatorConnector {
    /// Record the error and tear the process down so `connected()` reports
    /// the loss.
    fn fail(&mut self, err: TransportError) {
        warn!(command = %self.config.command, error = %err, "Simulator connection lost");
        self.last_error = Some(err);
        if let Some(process) = self.process.take() {
            process.shutdown();
        }
    }

    /// Whether the simulator process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(|p| p.alive())
    }
}

impl Drop for SimulatorConnector {
    fn drop(&mut self) {
        self.close();
    }
}
