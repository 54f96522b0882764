//! Callback registry for telemetry keys.
//!
//! Handlers are registered explicitly during a host test's setup phase and
//! dispatched one at a time, in arrival order, by the session engine.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::outcome::SuiteOutcome;
use crate::protocol::constants::{DEFAULT_NOOP_KEYS, KEY_END, RESERVED_PREFIX, RESTRICTED_KEYS};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("Invalid callback key '{0}'")]
    InvalidKey(String),

    #[error("Key '{0}' is reserved for the protocol; register it with an explicit override")]
    ReservedKey(String),

    #[error("A callback is already registered for '{0}'")]
    Duplicate(String),
}

/// Side effects requested by handlers, applied by the session after each
/// dispatch.
#[derive(Debug, Default)]
pub struct HostActions {
    outbound: Vec<(String, String)>,
    reset_requested: bool,
    completion: Option<SuiteOutcome>,
    messages: Vec<String>,
}

impl HostActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a KV frame for the DUT.
    pub fn send_kv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.outbound.push((key.into(), value.into()));
    }

    pub fn reset_dut(&mut self) {
        self.reset_requested = true;
    }

    /// End the session. `Some(true)` passes, `Some(false)` fails and `None`
    /// leaves the verdict undefined.
    pub fn notify_complete(&mut self, result: Option<bool>) {
        self.completion = Some(match result {
            Some(true) => SuiteOutcome::Ok,
            Some(false) => SuiteOutcome::Fail,
            None => SuiteOutcome::Undef,
        });
    }

    pub fn complete_with(&mut self, outcome: SuiteOutcome) {
        self.completion = Some(outcome);
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn completion(&self) -> Option<SuiteOutcome> {
        self.completion
    }

    pub fn take_outbound(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.outbound)
    }

    pub fn take_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_requested)
    }

    pub fn take_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }
}

/// Handler invoked with `(key, value, timestamp)`.
pub type Callback = Box<dyn FnMut(&str, &str, f64, &mut HostActions) + Send>;

/// Key to handler table with protocol defaults pre-installed.
pub struct CallbackRegistry {
    handlers: HashMap<String, Callback>,
    /// Keys still bound to a built-in default.
    defaults: HashSet<String>,
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl CallbackRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            defaults: HashSet::new(),
        };
        for key in DEFAULT_NOOP_KEYS {
            registry.install_default(key, Box::new(|_: &str, _: &str, _: f64, _: &mut HostActions| {}));
        }
        registry.install_default(
            KEY_END,
            Box::new(|_: &str, value: &str, _: f64, actions: &mut HostActions| {
                actions.complete_with(SuiteOutcome::from_marker(value));
            }),
        );
        registry
    }

    fn install_default(&mut self, key: &str, callback: Callback) {
        self.handlers.insert(key.to_string(), callback);
        self.defaults.insert(key.to_string());
    }

    /// Register a handler for a test-defined key.
    ///
    /// Reserved (`__`-prefixed) and restricted keys are refused; use
    /// [`CallbackRegistry::register_forced`] to override those.
    pub fn register<F>(&mut self, key: &str, callback: F) -> Result<(), CallbackError>
    where
        F: FnMut(&str, &str, f64, &mut HostActions) + Send + 'static,
    {
        if !valid_key(key) {
            return Err(CallbackError::InvalidKey(key.to_string()));
        }
        if key.starts_with(RESERVED_PREFIX) || RESTRICTED_KEYS.contains(&key) {
            return Err(CallbackError::ReservedKey(key.to_string()));
        }
        if self.handlers.contains_key(key) && !self.defaults.contains(key) {
            return Err(CallbackError::Duplicate(key.to_string()));
        }
        self.defaults.remove(key);
        self.handlers.insert(key.to_string(), Box::new(callback));
        Ok(())
    }

    /// Register a handler, replacing whatever is bound to the key.
    pub fn register_forced<F>(&mut self, key: &str, callback: F) -> Result<(), CallbackError>
    where
        F: FnMut(&str, &str, f64, &mut HostActions) + Send + 'static,
    {
        if !valid_key(key) {
            return Err(CallbackError::InvalidKey(key.to_string()));
        }
        self.defaults.remove(key);
        self.handlers.insert(key.to_string(), Box::new(callback));
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    /// Run the handler bound to `key`. Returns `false` if none is bound.
    pub fn dispatch(&mut self, key: &str, value: &str, timestamp: f64, actions: &mut HostActions) -> bool {
        match self.handlers.get_mut(key) {
            Some(handler) => {
                handler(key, value, timestamp, actions);
                true
            }
            None => {
                debug!(key = %key, "No callback registered");
                false
            }
        }
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_reserved_defaults_are_noops() {
        let mut reg = CallbackRegistry::new();
        let mut actions = HostActions::new();
        assert!(reg.dispatch("__testcase_start", "A", 1.0, &mut actions));
        assert!(actions.completion().is_none());
        assert!(actions.take_outbound().is_empty());
    }

    #[test]
    fn test_default_end_handler() {
        let mut reg = CallbackRegistry::new();
        let mut actions = HostActions::new();
        reg.dispatch("end", "failure", 1.0, &mut actions);
        assert_eq!(actions.completion(), Some(SuiteOutcome::Fail));
    }

    #[test]
    fn test_register_rejects_reserved() {
        let mut reg = CallbackRegistry::new();
        assert_eq!(
            reg.register("__testcase_start", |_, _, _, _| {}),
            Err(CallbackError::ReservedKey("__testcase_start".into()))
        );
        assert_eq!(
            reg.register("__custom", |_, _, _, _| {}),
            Err(CallbackError::ReservedKey("__custom".into()))
        );
        assert_eq!(
            reg.register("bad key", |_, _, _, _| {}),
            Err(CallbackError::InvalidKey("bad key".into()))
        );
        assert!(reg.register_forced("__testcase_start", |_, _, _, _| {}).is_ok());
    }

    #[test]
    fn test_register_overrides_default_once() {
        let mut reg = CallbackRegistry::new();
        assert!(reg.register("end", |_, _, _, a| a.notify_complete(Some(true))).is_ok());
        assert_eq!(
            reg.register("end", |_, _, _, _| {}),
            Err(CallbackError::Duplicate("end".into()))
        );

        let mut actions = HostActions::new();
        reg.dispatch("end", "failure", 0.0, &mut actions);
        assert_eq!(actions.completion(), Some(SuiteOutcome::Ok));
    }

    #[test]
    fn test_handler_receives_arguments_and_acts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut reg = CallbackRegistry::new();
        reg.register("ping", move |k, v, ts, actions| {
            sink.lock().unwrap().push((k.to_string(), v.to_string(), ts));
            actions.send_kv("pong", v);
            actions.reset_dut();
        })
        .unwrap();

        let mut actions = HostActions::new();
        assert!(reg.dispatch("ping", "7", 2.5, &mut actions));
        assert!(!reg.dispatch("unknown", "", 0.0, &mut actions));
        assert_eq!(*seen.lock().unwrap(), vec![("ping".to_string(), "7".to_string(), 2.5)]);
        assert_eq!(actions.take_outbound(), vec![("pong".to_string(), "7".to_string())]);
        assert!(actions.take_reset());
        assert!(!actions.take_reset());
    }
}
