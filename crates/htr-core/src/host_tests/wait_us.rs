use std::sync::{Arc, Mutex};

use super::HostTest;
use crate::callbacks::{CallbackError, CallbackRegistry};

/// Allowed relative deviation of one tick from a second.
const DEVIATION: f64 = 0.10;

/// Measures the spacing of `tick` messages, which the DUT prints once a
/// second from a busy-wait loop. Passes when every gap is within
/// [`DEVIATION`] of one second; `exit` ends the session.
#[derive(Default)]
pub struct WaitUsTest {
    ticks: Arc<Mutex<Vec<f64>>>,
}

fn ticks_regular(ticks: &[f64]) -> bool {
    !ticks.is_empty()
        && ticks
            .windows(2)
            .all(|w| ((w[1] - w[0]) - 1.0).abs() <= DEVIATION)
}

impl HostTest for WaitUsTest {
    fn name(&self) -> &str {
        "wait_us_auto"
    }

    fn setup(&mut self, registry: &mut CallbackRegistry) -> Result<(), CallbackError> {
        let ticks = self.ticks.clone();
        registry.register("tick", move |_, _, timestamp, actions| {
            if let Ok(mut t) = ticks.lock() {
                t.push(timestamp);
            }
            actions.log(format!("tick at {timestamp:.3}"));
        })?;

        let ticks = self.ticks.clone();
        registry.register("exit", move |_, _, _, actions| {
            let passed = ticks.lock().map(|t| ticks_regular(&t)).unwrap_or(false);
            actions.notify_complete(Some(passed));
        })
    }

    fn result(&self) -> Option<bool> {
        let ticks = self.ticks.lock().ok()?;
        Some(ticks_regular(&ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::HostActions;
    use crate::outcome::SuiteOutcome;

    fn run(stamps: &[f64]) -> (Option<SuiteOutcome>, Option<bool>) {
        let mut test = WaitUsTest::default();
        let mut reg = CallbackRegistry::new();
        test.setup(&mut reg).unwrap();
        let mut actions = HostActions::new();
        for (i, ts) in stamps.iter().enumerate() {
            reg.dispatch("tick", &i.to_string(), *ts, &mut actions);
        }
        reg.dispatch("exit", "0", 99.0, &mut actions);
        (actions.completion(), test.result())
    }

    #[test]
    fn test_regular_ticks_pass() {
        assert_eq!(run(&[10.0, 11.02, 11.98, 13.0]), (Some(SuiteOutcome::Ok), Some(true)));
    }

    #[test]
    fn test_drifting_ticks_fail() {
        assert_eq!(run(&[10.0, 11.0, 12.5]), (Some(SuiteOutcome::Fail), Some(false)));
    }

    #[test]
    fn test_no_ticks_fail() {
        assert_eq!(run(&[]), (Some(SuiteOutcome::Fail), Some(false)));
    }
}
