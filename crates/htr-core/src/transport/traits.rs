//! Connector abstraction.
//!
//! Defines the `Connector` trait shared by the serial, remote and simulator
//! backends (and the mock used in tests).

use thiserror::Error;

use crate::protocol::kv::frame;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to open {resource}: {message}")]
    OpenFailed { resource: String, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Remote resource error: {0}")]
    Remote(String),

    #[error("Unknown resource manager client: {0}")]
    UnknownClient(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Uniform byte-stream contract over one DUT channel.
///
/// Methods never panic and never return `Err`: a failed operation records
/// the error (see [`Connector::last_error`]) and reports failure through the
/// return value, so the session engine stays transport-agnostic.
pub trait Connector: Send {
    /// Short human-readable backend name used in transcript tags.
    fn name(&self) -> &str;

    /// Return whatever bytes are available, possibly none. Blocks at most a
    /// short poll interval.
    fn read(&mut self, max_bytes: usize) -> Vec<u8>;

    /// Best-effort send.
    fn write(&mut self, payload: &[u8], log_it: bool) -> bool;

    /// Frame and send a KV pair. Returns the frame on success.
    fn write_kv(&mut self, key: &str, value: &str) -> Option<String> {
        let frame = frame(key, value);
        if self.write(frame.as_bytes(), true) {
            Some(frame)
        } else {
            None
        }
    }

    fn flush(&mut self);

    /// Reset the DUT. Returns `false` if the reset could not be issued.
    fn reset(&mut self) -> bool;

    fn connected(&self) -> bool;

    fn last_error(&self) -> Option<TransportError>;

    /// Release the underlying channel. Safe to call more than once.
    fn close(&mut self);
}

impl<C: Connector + ?Sized> Connector for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&mut self, max_bytes: usize) -> Vec<u8> {
        (**self).read(max_bytes)
    }

    fn write(&mut self, payload: &[u8], log_it: bool) -> bool {
        (**self).write(payload, log_it)
    }

    fn write_kv(&mut self, key: &str, value: &str) -> Option<String> {
        (**self).write_kv(key, value)
    }

    fn flush(&mut self) {
        (**self).flush()
    }

    fn reset(&mut self) -> bool {
        (**self).reset()
    }

    fn connected(&self) -> bool {
        (**self).connected()
    }

    fn last_error(&self) -> Option<TransportError> {
        (**self).last_error()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
