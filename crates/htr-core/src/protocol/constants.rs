//! Telemetry protocol constants.
//!
//! Keys with the `__` prefix belong to the protocol itself; test-defined
//! keys must not use it.

// ============================================================================
// Framing
// ============================================================================

/// Opening delimiter of a KV frame.
pub const FRAME_OPEN: &str = "{{";
/// Closing delimiter of a KV frame.
pub const FRAME_CLOSE: &str = "}}";
/// Separator between key and value (and between value fields).
pub const FIELD_SEP: char = ';';
/// Prefix reserved for protocol bookkeeping keys.
pub const RESERVED_PREFIX: &str = "__";
/// Longest plain text line kept while waiting for a newline.
pub const MAX_LINE_LEN: usize = 4096;
/// Longest line kept while a `{{` frame is still open. Coverage frames carry
/// whole hex-encoded gcda files.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

// ============================================================================
// Test case bookkeeping
// ============================================================================

pub const KEY_TESTCASE_START: &str = "__testcase_start";
pub const KEY_TESTCASE_FINISH: &str = "__testcase_finish";
pub const KEY_TESTCASE_COUNT: &str = "__testcase_count";
pub const KEY_TESTCASE_NAME: &str = "__testcase_name";
pub const KEY_TESTCASE_SUMMARY: &str = "__testcase_summary";
pub const KEY_COVERAGE_START: &str = "__coverage_start";
pub const KEY_RXD_LINE: &str = "__rxd_line";
pub const KEY_THREAD_INFO: &str = "__thread_info";

// ============================================================================
// Session control
// ============================================================================

pub const KEY_SYNC: &str = "__sync";
pub const KEY_TIMEOUT: &str = "__timeout";
pub const KEY_HOST_TEST_NAME: &str = "__host_test_name";
pub const KEY_VERSION: &str = "__version";
pub const KEY_NOTIFY_COMPLETE: &str = "__notify_complete";
pub const KEY_EXIT: &str = "__exit";
pub const KEY_EXIT_EVENT_QUEUE: &str = "__exit_event_queue";
pub const KEY_RESET_DUT: &str = "__reset_dut";
pub const KEY_RESET: &str = "__reset";

// ============================================================================
// Suite markers
// ============================================================================

pub const KEY_END: &str = "end";
pub const KEY_RESULT: &str = "result";

// ============================================================================
// Memory metrics
// ============================================================================

pub const KEY_MAX_HEAP_USAGE: &str = "max_heap_usage";
pub const KEY_RESERVED_HEAP: &str = "reserved_heap";

/// Reserved keys that get a no-op handler unless a host test overrides them.
pub const DEFAULT_NOOP_KEYS: &[&str] = &[
    KEY_COVERAGE_START,
    KEY_TESTCASE_START,
    KEY_TESTCASE_FINISH,
    KEY_TESTCASE_COUNT,
    KEY_TESTCASE_NAME,
    KEY_TESTCASE_SUMMARY,
    KEY_RXD_LINE,
];

/// Keys that can only be bound with an explicit override.
pub const RESTRICTED_KEYS: &[&str] = &[
    KEY_COVERAGE_START,
    KEY_TESTCASE_START,
    KEY_TESTCASE_FINISH,
    KEY_TESTCASE_SUMMARY,
    KEY_EXIT,
    KEY_EXIT_EVENT_QUEUE,
];
