//! Suite outcomes and per-test-case results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decoder::memory::MemoryMetrics;

/// Canonical, terminal suite outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuiteOutcome {
    Ok,
    Fail,
    Error,
    Skipped,
    Undef,
    Timeout,
    NoImage,
    MbedAssert,
    BuildFailed,
    SyncFailed,
    IoerrCopy,
    IoerrDisk,
    IoerrSerial,
}

impl SuiteOutcome {
    /// Map the value of a `result`/`end` marker onto an outcome.
    ///
    /// Unknown markers decode as [`SuiteOutcome::Undef`].
    pub fn from_marker(marker: &str) -> Self {
        match marker.trim().to_ascii_lowercase().as_str() {
            "success" => SuiteOutcome::Ok,
            "failure" => SuiteOutcome::Fail,
            "error" => SuiteOutcome::Error,
            "skipped" => SuiteOutcome::Skipped,
            "end" | "undefined" => SuiteOutcome::Undef,
            "timeout" => SuiteOutcome::Timeout,
            "no_image" => SuiteOutcome::NoImage,
            "mbed_assert" => SuiteOutcome::MbedAssert,
            "build_failed" => SuiteOutcome::BuildFailed,
            "sync_failed" => SuiteOutcome::SyncFailed,
            "ioerr_copy" => SuiteOutcome::IoerrCopy,
            "ioerr_disk" => SuiteOutcome::IoerrDisk,
            "ioerr_serial" => SuiteOutcome::IoerrSerial,
            _ => SuiteOutcome::Undef,
        }
    }

    /// Marker value that decodes back into this outcome.
    pub fn marker(&self) -> &'static str {
        match self {
            SuiteOutcome::Ok => "success",
            SuiteOutcome::Fail => "failure",
            SuiteOutcome::Error => "error",
            SuiteOutcome::Skipped => "skipped",
            SuiteOutcome::Undef => "end",
            SuiteOutcome::Timeout => "timeout",
            SuiteOutcome::NoImage => "no_image",
            SuiteOutcome::MbedAssert => "mbed_assert",
            SuiteOutcome::BuildFailed => "build_failed",
            SuiteOutcome::SyncFailed => "sync_failed",
            SuiteOutcome::IoerrCopy => "ioerr_copy",
            SuiteOutcome::IoerrDisk => "ioerr_disk",
            SuiteOutcome::IoerrSerial => "ioerr_serial",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SuiteOutcome::Ok => "OK",
            SuiteOutcome::Fail => "FAIL",
            SuiteOutcome::Error => "ERROR",
            SuiteOutcome::Skipped => "SKIPPED",
            SuiteOutcome::Undef => "UNDEF",
            SuiteOutcome::Timeout => "TIMEOUT",
            SuiteOutcome::NoImage => "NO_IMAGE",
            SuiteOutcome::MbedAssert => "MBED_ASSERT",
            SuiteOutcome::BuildFailed => "BUILD_FAILED",
            SuiteOutcome::SyncFailed => "SYNC_FAILED",
            SuiteOutcome::IoerrCopy => "IOERR_COPY",
            SuiteOutcome::IoerrDisk => "IOERR_DISK",
            SuiteOutcome::IoerrSerial => "IOERR_SERIAL",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SuiteOutcome::Ok)
    }
}

impl fmt::Display for SuiteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestCaseState {
    Pending,
    Running,
    Ok,
    Fail,
    Error,
    Skipped,
}

impl TestCaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestCaseState::Ok | TestCaseState::Fail | TestCaseState::Error | TestCaseState::Skipped
        )
    }
}

impl fmt::Display for TestCaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestCaseState::Pending => write!(f, "PENDING"),
            TestCaseState::Running => write!(f, "RUNNING"),
            TestCaseState::Ok => write!(f, "OK"),
            TestCaseState::Fail => write!(f, "FAIL"),
            TestCaseState::Error => write!(f, "ERROR"),
            TestCaseState::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Result of one named test case inside a suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub name: String,
    pub state: TestCaseState,
    pub passed: u32,
    pub failed: u32,
    pub start_ts: Option<f64>,
    pub end_ts: Option<f64>,
    pub duration: f64,
    pub captured_log: Vec<String>,
}

impl TestCaseResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: TestCaseState::Pending,
            passed: 0,
            failed: 0,
            start_ts: None,
            end_ts: None,
            duration: 0.0,
            captured_log: Vec::new(),
        }
    }

    /// Mark the case running. Ignored once the case is terminal.
    pub fn start(&mut self, ts: f64) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TestCaseState::Running;
        self.start_ts = Some(ts);
    }

    /// Finish the case with its pass/fail counters. Ignored once terminal.
    pub fn finish(&mut self, ts: f64, passed: u32, failed: u32) {
        if self.state.is_terminal() {
            return;
        }
        self.passed = passed;
        self.failed = failed;
        self.end_ts = Some(ts);
        self.duration = match self.start_ts {
            Some(start) => (ts - start).max(0.0),
            None => 0.0,
        };
        self.state = if failed == 0 {
            TestCaseState::Ok
        } else {
            TestCaseState::Fail
        };
    }

    /// Close out a case at end of stream.
    pub fn finalize(&mut self) {
        match self.state {
            TestCaseState::Running => self.state = TestCaseState::Error,
            TestCaseState::Pending => {
                self.state = TestCaseState::Skipped;
                self.duration = 0.0;
            }
            _ => {}
        }
    }

    pub fn result_text(&self) -> String {
        self.state.to_string()
    }
}

/// Result of one execution attempt of a test binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub outcome: SuiteOutcome,
    pub raw_output: String,
    pub duration: f64,
    pub test_cases: BTreeMap<String, TestCaseResult>,
    pub memory_metrics: Option<MemoryMetrics>,
    /// `(passed, failed)` reported by the device, if any.
    pub summary: Option<(u32, u32)>,
}

impl SuiteResult {
    pub fn new(outcome: SuiteOutcome) -> Self {
        Self {
            outcome,
            raw_output: String::new(),
            duration: 0.0,
            test_cases: BTreeMap::new(),
            memory_metrics: None,
            summary: None,
        }
    }

    /// Pass/fail counts derived from the individual case states.
    pub fn computed_summary(&self) -> (u32, u32) {
        self.test_cases
            .values()
            .fold((0, 0), |(p, f), case| match case.state {
                TestCaseState::Ok => (p + 1, f),
                TestCaseState::Fail | TestCaseState::Error => (p, f + 1),
                _ => (p, f),
            })
    }

    pub fn summary_matches(&self) -> bool {
        match self.summary {
            Some(reported) => reported == self.computed_summary(),
            None => true,
        }
    }
}
