//! Mock connector for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{Connector, TransportError};

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

/// In-memory connector. Clones share state, so a test can keep a handle
/// while the session owns another.
#[derive(Clone)]
pub struct MockConnector {
    /// Queued chunks returned on read.
    inbound: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<String>>>,
    /// Whether the device is "connected".
    connected: Arc<Mutex<bool>>,
    /// Number of resets issued.
    resets: Arc<Mutex<usize>>,
    closed: Arc<Mutex<usize>>,
    /// Produces inbound lines in reply to each write.
    responder: Arc<Mutex<Option<Responder>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            inbound: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            resets: Arc::new(Mutex::new(0)),
            closed: Arc::new(Mutex::new(0)),
            responder: Arc::new(Mutex::new(None)),
        }
    }

    /// Mock whose responder echoes every `__sync` frame back, like a DUT
    /// running the greeting handshake.
    pub fn with_sync_echo() -> Self {
        let mock = Self::new();
        mock.set_responder(|written| {
            if written.starts_with("{{__sync;") {
                vec![written.trim_end().to_string()]
            } else {
                Vec::new()
            }
        });
        mock
    }

    /// Queue raw bytes to be returned by a later read.
    pub fn queue_bytes(&self, data: &[u8]) {
        self.inbound.lock().unwrap().push_back(data.to_vec());
    }

    /// Queue a line; the newline is appended.
    pub fn queue_line(&self, line: &str) {
        self.queue_bytes(format!("{line}\n").as_bytes());
    }

    pub fn set_responder<F>(&self, f: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<String> {
        self.write_log.lock().unwrap().clone()
    }

    pub fn reset_count(&self) -> usize {
        *self.resets.lock().unwrap()
    }

    pub fn close_count(&self) -> usize {
        *self.closed.lock().unwrap()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MockConnector {
    fn name(&self) -> &str {
        "MOCK"
    }

    fn read(&mut self, max_bytes: usize) -> Vec<u8> {
        if !self.connected() {
            return Vec::new();
        }
        let mut inbound = self.inbound.lock().unwrap();
        match inbound.pop_front() {
            Some(mut chunk) if chunk.len() > max_bytes => {
                let rest = chunk.split_off(max_bytes);
                inbound.push_front(rest);
                chunk
            }
            Some(chunk) => chunk,
            None => Vec::new(),
        }
    }

    fn write(&mut self, payload: &[u8], _log_it: bool) -> bool {
        if !self.connected() {
            return false;
        }
        let text = String::from_utf8_lossy(payload).to_string();
        self.write_log.lock().unwrap().push(text.clone());
        if let Some(responder) = self.responder.lock().unwrap().as_mut() {
            for line in responder(&text) {
                self.queue_line(&line);
            }
        }
        true
    }

    fn flush(&mut self) {}

    fn reset(&mut self) -> bool {
        *self.resets.lock().unwrap() += 1;
        self.connected()
    }

    fn connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn last_error(&self) -> Option<TransportError> {
        if self.connected() {
            None
        } else {
            Some(TransportError::Disconnected)
        }
    }

    fn close(&mut self) {
        *self.closed.lock().unwrap() += 1;
    }
}
