use std::sync::{Arc, Mutex};

use super::HostTest;
use crate::callbacks::{CallbackError, CallbackRegistry};

const HELLO_WORLD: &str = "Hello World";

/// Passes when the DUT greets with `hello_world;Hello World`, and ends the
/// session on the greeting.
#[derive(Default)]
pub struct HelloTest {
    verdict: Arc<Mutex<Option<bool>>>,
}

impl HostTest for HelloTest {
    fn name(&self) -> &str {
        "hello_auto"
    }

    fn setup(&mut self, registry: &mut CallbackRegistry) -> Result<(), CallbackError> {
        let verdict = self.verdict.clone();
        registry.register("hello_world", move |_, value, _, actions| {
            let passed = value == HELLO_WORLD;
            if let Ok(mut v) = verdict.lock() {
                *v = Some(passed);
            }
            actions.notify_complete(Some(passed));
        })
    }

    fn result(&self) -> Option<bool> {
        self.verdict.lock().ok().and_then(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::HostActions;
    use crate::outcome::SuiteOutcome;

    #[test]
    fn test_greeting_passes() {
        let mut test = HelloTest::default();
        let mut reg = CallbackRegistry::new();
        test.setup(&mut reg).unwrap();
        assert_eq!(test.result(), None);

        let mut actions = HostActions::new();
        reg.dispatch("hello_world", "Hello World", 0.5, &mut actions);
        assert_eq!(actions.completion(), Some(SuiteOutcome::Ok));
        assert_eq!(test.result(), Some(true));
    }

    #[test]
    fn test_wrong_greeting_fails() {
        let mut test = HelloTest::default();
        let mut reg = CallbackRegistry::new();
        test.setup(&mut reg).unwrap();
        let mut actions = HostActions::new();
        reg.dispatch("hello_world", "hello world", 0.5, &mut actions);
        assert_eq!(actions.completion(), Some(SuiteOutcome::Fail));
        assert_eq!(test.result(), Some(false));
    }
}
