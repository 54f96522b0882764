//! HTR-Core: host-side test execution engine for embedded targets.
//!
//! This crate flashes firmware test binaries onto physical or simulated
//! devices, supervises them over a byte-stream transport, decodes the
//! `{{key;value}}` telemetry they print and classifies the run at suite and
//! test-case level, across many devices in parallel.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: uniform connector over serial, remote and simulator backends (plus a mock)
//! - **Flash**: copy-plugin driven flashing with remount/sentinel verification
//! - **Protocol**: KV framing, reserved keys and transcripts
//! - **Callbacks / Host tests**: key to handler dispatch and host-side test logic
//! - **Session**: live sync + supervision of one DUT
//! - **Decoder**: transcript to suite and test-case results
//! - **Orchestrator**: per-device workers, retries, shuffling and the cross-process kettle
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use htr_core::{
//!     CancellationToken, DeviceInventory, HostTestExecutor, Orchestrator, RunConfig, TestSpec,
//! };
//!
//! let config = RunConfig::load_from_file("htr.toml").unwrap();
//! let mut inventory = DeviceInventory::load_from_file("devices.toml").unwrap();
//! let targets = TestSpec::load_from_file("test_spec.json")
//!     .unwrap()
//!     .to_build_targets(&config);
//!
//! let executor = HostTestExecutor::new(config.clone(), config.plugin_registry().unwrap());
//! let summary = Orchestrator::new(config, executor, CancellationToken::new())
//!     .run(&targets, &mut inventory);
//! std::process::exit(summary.exit_code());
//! ```

pub mod callbacks;
pub mod cancel;
pub mod config;
pub mod decoder;
pub mod device;
pub mod events;
pub mod executor;
pub mod flash;
pub mod host_tests;
pub mod lock;
pub mod orchestrator;
pub mod outcome;
pub mod plugins;
pub mod protocol;
pub mod report;
pub mod session;
pub mod task;
pub mod testspec;
pub mod transport;

// Re-exports for convenience
pub use callbacks::{CallbackError, CallbackRegistry, HostActions};
pub use cancel::CancellationToken;
pub use config::{LockConfig, RunConfig};
pub use decoder::{DecodeOptions, Decoder, decode, decode_log};
pub use device::{Device, DeviceAddress, DeviceInventory};
pub use events::{HtrEvent, HtrObserver, HtrPhase, LogLevel, NullObserver, TracingObserver};
pub use executor::{HostTestExecutor, TaskExecutor};
pub use flash::{DeviceFs, FlashConfig, FlashError, Flasher, LocalFs};
pub use host_tests::{HostTest, HostTestRegistry};
pub use lock::{Kettle, KettleGuard, LockError};
pub use orchestrator::{Orchestrator, RunSummary};
pub use outcome::{SuiteOutcome, SuiteResult, TestCaseResult, TestCaseState};
pub use plugins::{Plugin, PluginArgs, PluginError, PluginRegistry, PluginType};
pub use protocol::{EventMessage, Transcript};
pub use report::{SuiteReport, TestReport};
pub use session::{HostTestSession, SessionConfig, SessionOutcome};
pub use task::{BuildTarget, ExecutionTask, FirmwareImage};
pub use testspec::{SpecError, TestFilter, TestSpec};
pub use transport::{Connector, MockConnector, TransportError};
