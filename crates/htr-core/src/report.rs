//! Result object handed to (external) report writers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::decoder::memory::MemoryMetrics;
use crate::outcome::{SuiteOutcome, SuiteResult, TestCaseState};
use crate::task::ExecutionTask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub passed: u32,
    pub failed: u32,
    pub result_text: String,
    pub duration: f64,
    pub log: Vec<String>,
}

/// One test binary's final result on one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub outcome: SuiteOutcome,
    pub raw_output: String,
    pub duration: f64,
    pub platform: String,
    pub target_id: String,
    pub copy_method: String,
    pub image_path: PathBuf,
    /// Executions it took, retries included.
    pub attempts: u32,
    pub test_cases: BTreeMap<String, CaseReport>,
    pub memory_metrics: Option<MemoryMetrics>,
}

impl SuiteReport {
    pub fn from_result(
        result: SuiteResult,
        platform: &str,
        target_id: &str,
        copy_method: &str,
        image_path: PathBuf,
        attempts: u32,
    ) -> Self {
        let test_cases = result
            .test_cases
            .into_iter()
            .map(|(name, case)| {
                let report = CaseReport {
                    passed: case.passed,
                    failed: case.failed,
                    result_text: case.result_text(),
                    duration: case.duration,
                    log: case.captured_log,
                };
                (name, report)
            })
            .collect();
        Self {
            outcome: result.outcome,
            raw_output: result.raw_output,
            duration: result.duration,
            platform: platform.to_string(),
            target_id: target_id.to_string(),
            copy_method: copy_method.to_string(),
            image_path,
            attempts,
            test_cases,
            memory_metrics: result.memory_metrics,
        }
    }

    /// `(passed, failed)` case counts.
    pub fn case_counts(&self) -> (usize, usize) {
        let ok = TestCaseState::Ok.to_string();
        let skipped = TestCaseState::Skipped.to_string();
        self.test_cases.values().fold((0, 0), |(p, f), case| {
            if case.result_text == ok {
                (p + 1, f)
            } else if case.result_text == skipped {
                (p, f)
            } else {
                (p, f + 1)
            }
        })
    }
}

/// build name → test name → suite report.
pub type PartialReport = BTreeMap<String, BTreeMap<String, SuiteReport>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub builds: PartialReport,
    /// Seed the task order was shuffled with.
    pub shuffle_seed: Option<u64>,
    /// Build platforms no device matched.
    pub unmatched_platforms: Vec<String>,
    /// Build platforms whose devices were all held elsewhere; their tests
    /// are recorded as not executed.
    #[serde(default)]
    pub busy_platforms: Vec<String>,
}

impl TestReport {
    pub fn new(shuffle_seed: Option<u64>) -> Self {
        Self {
            shuffle_seed,
            ..Self::default()
        }
    }

    /// Record a test that never reached a device.
    pub fn insert_not_executed(&mut self, task: &ExecutionTask, platform: &str, reason: &str) {
        let mut result = SuiteResult::new(SuiteOutcome::Skipped);
        result.raw_output = format!("Test was not executed: {reason}");
        let report = SuiteReport::from_result(
            result,
            platform,
            "",
            &task.copy_method,
            task.image.path.clone(),
            0,
        );
        self.insert(&task.build, &task.image.test_name, report);
    }

    pub fn insert(&mut self, build: &str, test: &str, report: SuiteReport) {
        self.builds
            .entry(build.to_string())
            .or_default()
            .insert(test.to_string(), report);
    }

    /// Fold a worker's partial map into the report.
    pub fn merge(&mut self, partial: PartialReport) {
        for (build, suites) in partial {
            self.builds.entry(build).or_default().extend(suites);
        }
    }

    pub fn suites(&self) -> impl Iterator<Item = (&str, &str, &SuiteReport)> {
        self.builds.iter().flat_map(|(build, suites)| {
            suites
                .iter()
                .map(move |(test, suite)| (build.as_str(), test.as_str(), suite))
        })
    }

    /// Overall outcome: OK only when every suite passed.
    pub fn suite_outcome(&self) -> SuiteOutcome {
        if self.suites().all(|(_, _, s)| s.outcome.is_success()) {
            SuiteOutcome::Ok
        } else {
            SuiteOutcome::Fail
        }
    }

    /// Number of suites per outcome.
    pub fn outcome_counts(&self) -> BTreeMap<SuiteOutcome, usize> {
        let mut counts = BTreeMap::new();
        for (_, _, suite) in self.suites() {
            *counts.entry(suite.outcome).or_insert(0) += 1;
        }
        counts
    }
}
