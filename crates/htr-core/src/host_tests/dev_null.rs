use std::sync::{Arc, Mutex};

use super::HostTest;
use crate::callbacks::{CallbackError, CallbackRegistry, HostActions};
use crate::protocol::constants::KEY_END;

/// Checks that output sent to the null stream never reaches the host.
///
/// `to_stdout` passes the test; `to_null` or an `end` marker fails it. The
/// session ends through `__exit`.
#[derive(Default)]
pub struct DevNullTest {
    verdict: Arc<Mutex<Option<bool>>>,
}

impl DevNullTest {
    fn verdict_setter(
        &self,
        passed: bool,
    ) -> impl FnMut(&str, &str, f64, &mut HostActions) + Send + 'static {
        let verdict = self.verdict.clone();
        move |key, _, _, actions| {
            if let Ok(mut v) = verdict.lock() {
                *v = Some(passed);
            }
            if passed {
                actions.log(format!("{key} reached the host"));
            }
        }
    }
}

impl HostTest for DevNullTest {
    fn name(&self) -> &str {
        "dev_null_auto"
    }

    fn setup(&mut self, registry: &mut CallbackRegistry) -> Result<(), CallbackError> {
        registry.register(KEY_END, self.verdict_setter(false))?;
        registry.register("to_null", self.verdict_setter(false))?;
        registry.register("to_stdout", self.verdict_setter(true))
    }

    fn result(&self) -> Option<bool> {
        self.verdict.lock().ok().and_then(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdout_passes_and_null_fails() {
        let mut test = DevNullTest::default();
        let mut reg = CallbackRegistry::new();
        test.setup(&mut reg).unwrap();

        let mut actions = HostActions::new();
        reg.dispatch("to_stdout", "0", 0.1, &mut actions);
        assert_eq!(test.result(), Some(true));
        assert_eq!(actions.take_messages().len(), 1);

        reg.dispatch("to_null", "0", 0.2, &mut actions);
        assert_eq!(test.result(), Some(false));
    }

    #[test]
    fn test_end_marker_does_not_complete() {
        let mut test = DevNullTest::default();
        let mut reg = CallbackRegistry::new();
        test.setup(&mut reg).unwrap();
        let mut actions = HostActions::new();
        reg.dispatch("end", "success", 0.3, &mut actions);
        assert!(actions.completion().is_none());
        assert_eq!(test.result(), Some(false));
    }
}
