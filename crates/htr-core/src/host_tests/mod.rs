//! Host tests: the host-side half of a firmware test binary.
//!
//! A host test binds handlers for the keys its firmware emits and may give
//! its own verdict through [`HostTest::result`].

mod default_auto;
mod dev_null;
mod echo;
mod hello;
mod wait_us;

use std::collections::BTreeMap;

pub use default_auto::DefaultAuto;
pub use dev_null::DevNullTest;
pub use echo::EchoTest;
pub use hello::HelloTest;
pub use wait_us::WaitUsTest;

use crate::callbacks::{CallbackError, CallbackRegistry};

/// Name of the host test used when the DUT names none (or an unknown one).
pub const DEFAULT_HOST_TEST: &str = "default_auto";

pub trait HostTest: Send {
    fn name(&self) -> &str;

    /// Bind callbacks for the keys this test understands.
    fn setup(&mut self, registry: &mut CallbackRegistry) -> Result<(), CallbackError>;

    /// Verdict computed by the test itself, if it has one.
    fn result(&self) -> Option<bool> {
        None
    }

    fn teardown(&mut self) {}
}

type HostTestFactory = Box<dyn Fn() -> Box<dyn HostTest> + Send + Sync>;

/// Name to factory table of host tests.
pub struct HostTestRegistry {
    factories: BTreeMap<String, HostTestFactory>,
}

impl HostTestRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in host tests.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_HOST_TEST, || Box::new(DefaultAuto));
        registry.register("echo", || Box::new(EchoTest::default()));
        registry.register("hello_auto", || Box::new(HelloTest::default()));
        registry.register("dev_null_auto", || Box::new(DevNullTest::default()));
        registry.register("wait_us_auto", || Box::new(WaitUsTest::default()));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn HostTest> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn HostTest>> {
        self.factories.get(name).map(|f| f())
    }

    /// Instantiate `name`, falling back to `default_auto`.
    pub fn create_or_default(&self, name: &str) -> Box<dyn HostTest> {
        self.create(name)
            .or_else(|| self.create(DEFAULT_HOST_TEST))
            .unwrap_or_else(|| Box::new(DefaultAuto))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for HostTestRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let reg = HostTestRegistry::with_builtins();
        assert_eq!(
            reg.names(),
            vec!["default_auto", "dev_null_auto", "echo", "hello_auto", "wait_us_auto"]
        );
        for name in reg.names() {
            assert_eq!(reg.create(name).unwrap().name(), name);
        }
    }

    #[test]
    fn test_unknown_falls_back_to_default() {
        let reg = HostTestRegistry::with_builtins();
        assert!(reg.create("nope").is_none());
        assert_eq!(reg.create_or_default("nope").name(), DEFAULT_HOST_TEST);
        assert_eq!(HostTestRegistry::new().create_or_default("x").name(), DEFAULT_HOST_TEST);
    }
}
