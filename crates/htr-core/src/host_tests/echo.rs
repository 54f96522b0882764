//! Echo host test: round-trips random tokens through the DUT.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::HostTest;
use crate::callbacks::{CallbackError, CallbackRegistry, HostActions};

#[derive(Debug, Default)]
struct EchoState {
    remaining: u32,
    sent: Vec<String>,
    received: Vec<String>,
}

impl EchoState {
    fn send_next(&mut self, actions: &mut HostActions) {
        if self.remaining > 0 {
            let token = Uuid::new_v4().to_string();
            actions.send_kv("echo", token.clone());
            self.sent.push(token);
            self.remaining -= 1;
        }
    }
}

/// Answers the `echo_count;N` handshake, then sends N `echo` tokens one at
/// a time. Passes iff the echoed tokens match the sent ones in order.
#[derive(Default)]
pub struct EchoTest {
    state: Arc<Mutex<EchoState>>,
}

impl HostTest for EchoTest {
    fn name(&self) -> &str {
        "echo"
    }

    fn setup(&mut self, registry: &mut CallbackRegistry) -> Result<(), CallbackError> {
        let state = self.state.clone();
        registry.register("echo_count", move |key, value, _, actions| {
            let Ok(mut s) = state.lock() else { return };
            s.remaining = value.trim().parse().unwrap_or(0);
            actions.send_kv(key, value);
            s.send_next(actions);
        })?;

        let state = self.state.clone();
        registry.register("echo", move |_, value, _, actions| {
            let Ok(mut s) = state.lock() else { return };
            s.received.push(value.to_string());
            s.send_next(actions);
        })
    }

    fn result(&self) -> Option<bool> {
        let s = self.state.lock().ok()?;
        Some(s.sent == s.received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_handshake_and_verdict() {
        let mut echo = EchoTest::default();
        let mut reg = CallbackRegistry::new();
        echo.setup(&mut reg).unwrap();

        let mut actions = HostActions::new();
        reg.dispatch("echo_count", "2", 0.0, &mut actions);
        let out = actions.take_outbound();
        assert_eq!(out[0], ("echo_count".to_string(), "2".to_string()));
        assert_eq!(out[1].0, "echo");

        reg.dispatch("echo", &out[1].1, 0.1, &mut actions);
        let out2 = actions.take_outbound();
        assert_eq!(out2.len(), 1);
        reg.dispatch("echo", &out2[0].1, 0.2, &mut actions);
        assert!(actions.take_outbound().is_empty());
        assert_eq!(echo.result(), Some(true));
    }

    #[test]
    fn test_echo_mismatch_fails() {
        let mut echo = EchoTest::default();
        let mut reg = CallbackRegistry::new();
        echo.setup(&mut reg).unwrap();
        let mut actions = HostActions::new();
        reg.dispatch("echo_count", "1", 0.0, &mut actions);
        reg.dispatch("echo", "garbage", 0.1, &mut actions);
        assert_eq!(echo.result(), Some(false));
    }
}
