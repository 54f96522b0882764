//! Local serial port backend built on `serialport`.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use super::traits::{Connector, TransportError};

/// Read timeout, doubling as the connector's poll interval.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);
/// Delay between attempts to open a port that is not ready yet.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);
/// How long the break condition is held during a reset.
pub const BREAK_DURATION: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound on waiting for the port to appear and open.
    pub polling_timeout: Duration,
    /// Settle delay after a reset.
    pub forced_reset_timeout: Duration,
    pub skip_reset: bool,
}

impl SerialConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            polling_timeout: Duration::from_secs(60),
            forced_reset_timeout: Duration::from_secs(1),
            skip_reset: false,
        }
    }
}

/// Poll until the serial device node exists.
pub fn wait_for_port(port: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if Path::new(port).exists() || port_listed(port) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(250));
    }
}

fn port_listed(port: &str) -> bool {
    serialport::available_ports()
        .map(|ports| ports.iter().any(|p| p.port_name == port))
        .unwrap_or(false)
}

pub struct SerialConnector {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    last_error: Option<TransportError>,
}

impl SerialConnector {
    /// Open the port, retrying until `polling_timeout`, then reset the DUT
    /// unless `skip_reset` is set.
    pub fn open(config: SerialConfig) -> Result<Self, TransportError> {
        let deadline = Instant::now() + config.polling_timeout;
        let port = loop {
            match serialport::new(&config.port, config.baud_rate)
                .timeout(READ_TIMEOUT)
                .open()
            {
                Ok(port) => break port,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::OpenFailed {
                            resource: config.port.clone(),
                            message: e.to_string(),
                        });
                    }
                    debug!(port = %config.port, error = %e, "Serial port not ready, retrying");
                    thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        };
        info!(port = %config.port, baud = config.baud_rate, "Serial port opened");

        let mut connector = Self {
            config,
            port: Some(port),
            last_error: None,
        };
        if !connector.config.skip_reset && !connector.reset() {
            warn!(port = %connector.config.port, "Initial reset failed");
        }
        Ok(connector)
    }

    fn fail(&mut self, err: TransportError) {
        warn!(port = %self.config.port, error = %err, "Serial port error");
        self.last_error = Some(err);
        self.port = None;
    }
}

impl Connector for SerialConnector {
    fn name(&self) -> &str {
        "SERI"
    }

    fn read(&mut self, max_bytes: usize) -> Vec<u8> {
        let Some(port) = self.port.as_mut() else {
            return Vec::new();
        };
        let mut buf = vec![0u8; max_bytes.max(1)];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                buf
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Vec::new()
            }
            Err(e) => {
                self.fail(TransportError::ReadFailed(e.to_string()));
                Vec::new()
            }
        }
    }

    fn write(&mut self, payload: &[u8], log_it: bool) -> bool {
        let Some(port) = self.port.as_mut() else {
            return false;
        };
        match port.write_all(payload).and_then(|_| port.flush()) {
            Ok(()) => {
                if log_it {
                    debug!(port = %self.config.port, data = %String::from_utf8_lossy(payload).trim_end(), "Serial write");
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
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.clear(ClearBuffer::All) {
                debug!(error = %e, "Failed to clear serial buffers");
            }
        }
    }

    fn reset(&mut self) -> bool {
        let Some(port) = self.port.as_mut() else {
            return false;
        };
        let result = port
            .set_break()
            .and_then(|_| {
                thread::sleep(BREAK_DURATION);
                port.clear_break()
            });
        match result {
            Ok(()) => {
                info!(port = %self.config.port, "Reset issued (serial break)");
                thread::sleep(self.config.forced_reset_timeout);
                true
            }
            Err(e) => {
                self.fail(TransportError::WriteFailed(e.to_string()));
                false
            }
        }
    }

    fn connected(&self) -> bool {
        self.port.is_some()
    }

    fn last_error(&self) -> Option<TransportError> {
        self.last_error.clone()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.config.port, "Serial port closed");
        }
    }
}

impl Drop for SerialConnector {
    fn drop(&mut self) {
        self.close();
    }
}
