//! Per-test-case state tracking.

use std::collections::BTreeMap;

use crate::outcome::{TestCaseResult, TestCaseState};

/// Builds [`TestCaseResult`]s from case events in arrival order.
#[derive(Debug, Default)]
pub struct CaseTracker {
    cases: BTreeMap<String, TestCaseResult>,
    expected_count: Option<u32>,
}

impl CaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, name: &str) -> &mut TestCaseResult {
        self.cases
            .entry(name.to_string())
            .or_insert_with(|| TestCaseResult::new(name))
    }

    pub fn set_count(&mut self, count: u32) {
        self.expected_count = Some(count);
    }

    pub fn expected_count(&self) -> Option<u32> {
        self.expected_count
    }

    /// `__testcase_name`
    pub fn named(&mut self, name: &str) {
        self.entry(name);
    }

    /// `__testcase_start`
    pub fn start(&mut self, name: &str, ts: f64) {
        self.entry(name).start(ts);
    }

    /// `__testcase_finish`
    pub fn finish(&mut self, name: &str, ts: f64, passed: u32, failed: u32) {
        self.entry(name).finish(ts, passed, failed);
    }

    /// Append a line to the log of every running case.
    pub fn capture(&mut self, line: &str) {
        for case in self.cases.values_mut() {
            if case.state == TestCaseState::Running {
                case.captured_log.push(line.to_string());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Finalize open cases and hand over the table.
    pub fn finish_stream(mut self) -> BTreeMap<String, TestCaseResult> {
        for case in self.cases.values_mut() {
            case.finalize();
        }
        self.cases
    }
}
