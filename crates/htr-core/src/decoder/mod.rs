//! Result decoder: turns a session transcript into a [`SuiteResult`].
//!
//! The decoder is incremental ([`Decoder::feed`]) so it can follow a live
//! session, and [`decode`] / [`decode_log`] wrap it for post-hoc use on a
//! captured transcript.

pub mod cases;
pub mod coverage;
pub mod memory;

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::outcome::{SuiteOutcome, SuiteResult, TestCaseResult, TestCaseState};
use crate::protocol::constants::*;
use crate::protocol::kv::parse_kv;
use crate::protocol::transcript::{Direction, Transcript, TranscriptLine};

use cases::CaseTracker;
use memory::{MemoryMetrics, ThreadStackInfo};

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Test binary name, used to name a synthesized case.
    pub test_name: String,
    /// Build directory coverage dumps are re-rooted into. Coverage payloads
    /// are ignored when unset.
    pub build_path: Option<PathBuf>,
    /// Measured wall-clock duration; derived from timestamps when unset.
    pub duration: Option<f64>,
}

/// Name of the single case synthesized for a suite without case events:
/// everything after `-test-` in the lowercased binary name.
pub fn synthesized_case_name(test_name: &str) -> String {
    let lower = test_name.to_lowercase();
    match lower.find("-test-") {
        Some(idx) => lower[idx + "-test-".len()..].to_string(),
        None => lower,
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    s.trim().parse().ok()
}

pub struct Decoder {
    options: DecodeOptions,
    cases: CaseTracker,
    summary: Option<(u32, u32)>,
    memory: MemoryMetrics,
    result_marker: Option<String>,
    end_marker: Option<String>,
    first_ts: Option<f64>,
    last_ts: Option<f64>,
    raw: String,
    received: Vec<String>,
}

impl Decoder {
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            cases: CaseTracker::new(),
            summary: None,
            memory: MemoryMetrics::default(),
            result_marker: None,
            end_marker: None,
            first_ts: None,
            last_ts: None,
            raw: String::new(),
            received: Vec::new(),
        }
    }

    pub fn feed(&mut self, line: &TranscriptLine) {
        self.raw.push_str(&line.to_string());
        self.raw.push('\n');

        if line.timestamp > 0.0 {
            self.first_ts.get_or_insert(line.timestamp);
            self.last_ts = Some(line.timestamp);
        }
        if line.direction != Direction::Rxd {
            return;
        }

        self.received.push(line.text.clone());
        self.cases.capture(&line.text);

        let Some((key, value)) = parse_kv(&line.text) else {
            return;
        };
        self.handle_kv(&key, &value, line.timestamp);
    }

    fn handle_kv(&mut self, key: &str, value: &str, ts: f64) {
        let fields: Vec<&str> = value.split(FIELD_SEP).collect();
        match key {
            KEY_TESTCASE_COUNT => {
                if let Some(n) = parse_u32(value) {
                    self.cases.set_count(n);
                }
            }
            KEY_TESTCASE_NAME => self.cases.named(value),
            KEY_TESTCASE_START => self.cases.start(value, ts),
            KEY_TESTCASE_FINISH => match fields.as_slice() {
                [name, passed, failed] => match (parse_u32(passed), parse_u32(failed)) {
                    (Some(p), Some(f)) => self.cases.finish(name, ts, p, f),
                    _ => debug!(value = %value, "Malformed testcase finish"),
                },
                _ => debug!(value = %value, "Malformed testcase finish"),
            },
            KEY_TESTCASE_SUMMARY => {
                if let [passed, failed] = fields.as_slice() {
                    if let (Some(p), Some(f)) = (parse_u32(passed), parse_u32(failed)) {
                        self.summary.get_or_insert((p, f));
                    }
                }
            }
            KEY_MAX_HEAP_USAGE => {
                if let Ok(n) = value.trim().parse() {
                    self.memory.max_heap = Some(n);
                }
            }
            KEY_RESERVED_HEAP => {
                if let Ok(n) = value.trim().parse() {
                    self.memory.reserved_heap = Some(n);
                }
            }
            KEY_THREAD_INFO => {
                if let Some(info) = ThreadStackInfo::parse(value) {
                    self.memory.add_thread(info);
                }
            }
            KEY_COVERAGE_START => self.handle_coverage(&fields),
            KEY_RESULT => self.result_marker = Some(value.to_string()),
            KEY_END => {
                self.end_marker.get_or_insert_with(|| value.to_string());
            }
            _ => {}
        }
    }

    fn handle_coverage(&self, fields: &[&str]) {
        let Some(build_path) = &self.options.build_path else {
            return;
        };
        let [path, payload] = fields else {
            debug!("Malformed coverage payload");
            return;
        };
        match coverage::decode_payload(payload) {
            Some(data) => {
                if let Err(e) = coverage::dump(build_path, path, &data) {
                    warn!(path = %path, error = %e, "Failed to store coverage data");
                }
            }
            None => warn!(path = %path, "Coverage payload is not valid hex"),
        }
    }

    /// Suite outcome: the `result` marker wins, then `end`, else TIMEOUT.
    fn outcome(&self) -> SuiteOutcome {
        match (&self.result_marker, &self.end_marker) {
            (Some(result), _) => SuiteOutcome::from_marker(result),
            (None, Some(end)) => SuiteOutcome::from_marker(end),
            (None, None) => SuiteOutcome::Timeout,
        }
    }

    pub fn finish(self) -> SuiteResult {
        let outcome = self.outcome();
        let duration = self.options.duration.unwrap_or_else(|| {
            match (self.first_ts, self.last_ts) {
                (Some(first), Some(last)) => (last - first).max(0.0),
                _ => 0.0,
            }
        });

        let mut result = SuiteResult::new(outcome);
        result.raw_output = self.raw;
        result.duration = duration;
        result.summary = self.summary;

        if self.cases.is_empty() && self.summary.is_none() {
            let mut case = TestCaseResult::new(synthesized_case_name(&self.options.test_name));
            let (state, passed, failed) = match outcome {
                SuiteOutcome::Ok => (TestCaseState::Ok, 1, 0),
                SuiteOutcome::Fail => (TestCaseState::Fail, 0, 1),
                _ => (TestCaseState::Error, 0, 1),
            };
            case.state = state;
            case.passed = passed;
            case.failed = failed;
            case.duration = duration;
            case.captured_log = self.received;
            result.summary = Some((passed, failed));
            result.test_cases.insert(case.name.clone(), case);
        } else {
            if let Some(expected) = self.cases.expected_count() {
                debug!(expected = expected, "Test case count reported");
            }
            result.test_cases = self.cases.finish_stream();
        }

        let mut memory = self.memory;
        if !memory.is_empty() {
            memory.summarize();
            result.memory_metrics = Some(memory);
        }

        if !result.summary_matches() {
            warn!(
                reported = ?result.summary,
                computed = ?result.computed_summary(),
                "Test case summary mismatch"
            );
        }
        result
    }
}

/// Decode a transcript captured by a session.
pub fn decode(transcript: &Transcript, options: DecodeOptions) -> SuiteResult {
    let mut decoder = Decoder::new(options);
    for line in transcript.lines() {
        decoder.feed(line);
    }
    decoder.finish()
}

/// Decode a captured log (rendered transcript or raw device output).
pub fn decode_log(text: &str, options: DecodeOptions) -> SuiteResult {
    decode(&Transcript::parse(text), options)
}

/// Check the DUT's output against a reference log: every non-blank line of
/// `reference` must show up, in order, inside a received line. Returns the
/// first reference line that was never seen.
pub fn unmatched_reference_line(transcript: &Transcript, reference: &str) -> Option<String> {
    let mut received = transcript
        .lines()
        .iter()
        .filter(|l| l.direction == Direction::Rxd);
    reference
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find(|expected| !received.any(|l| l.text.contains(*expected)))
        .map(str::to_string)
}
