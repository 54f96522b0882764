//! Live host-test session: synchronises with the DUT, dispatches telemetry
//! to the host test's callbacks and records the transcript.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::callbacks::{CallbackRegistry, HostActions};
use crate::cancel::CancellationToken;
use crate::events::{HtrEvent, HtrObserver, HtrPhase, LogLevel, TracingObserver};
use crate::host_tests::{DEFAULT_HOST_TEST, HostTest, HostTestRegistry};
use crate::outcome::SuiteOutcome;
use crate::protocol::constants::*;
use crate::protocol::kv::{KvWalker, frame, parse_kv};
use crate::protocol::transcript::{Direction, Transcript};
use crate::transport::Connector;

const READ_CHUNK: usize = 512;
const IDLE_SLEEP: Duration = Duration::from_millis(5);
const SYNC_RESEND_INTERVAL: Duration = Duration::from_secs(1);
/// Transcript tag for lines exchanged with the DUT.
const CONN_TAG: &str = "CONN";
/// Transcript tag for host-side annotations.
const HOST_TAG: &str = "HTST";

/// Configuration for a host-test session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target_id: String,
    /// `__sync` frames sent before giving up; zero skips the handshake.
    pub sync_packets: u32,
    pub sync_timeout: Duration,
    /// Supervision budget until the DUT announces its own via `__timeout`.
    pub default_timeout: Duration,
    /// Host test used until the DUT names one.
    pub host_test: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_id: String::new(),
            sync_packets: 2,
            sync_timeout: Duration::from_secs(5),
            default_timeout: Duration::from_secs(10),
            host_test: DEFAULT_HOST_TEST.to_string(),
        }
    }
}

/// What a session produced.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub outcome: SuiteOutcome,
    pub transcript: Transcript,
    pub duration: f64,
    pub host_test: String,
    /// Value of the DUT's `__version` message.
    pub version: Option<String>,
}

enum LineStep {
    Continue,
    Complete(SuiteOutcome),
    Exit,
}

/// One supervised run of a firmware binary over a connector.
pub struct HostTestSession<'r, C: Connector, O: HtrObserver> {
    connector: C,
    config: SessionConfig,
    observer: Arc<O>,
    registry: &'r HostTestRegistry,
    cancel: CancellationToken,

    transcript: Transcript,
    walker: KvWalker,
    host_test: Box<dyn HostTest>,
    callbacks: CallbackRegistry,
    deadline: Instant,
    version: Option<String>,
    /// Lines that arrived in the same chunk as the sync acknowledgement.
    pending: Vec<String>,
}

impl<'r, C: Connector> HostTestSession<'r, C, TracingObserver> {
    /// Create a session with the default tracing observer.
    pub fn new(
        connector: C,
        config: SessionConfig,
        registry: &'r HostTestRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_observer(connector, config, registry, cancel, Arc::new(TracingObserver))
    }
}

impl<'r, C: Connector, O: HtrObserver> HostTestSession<'r, C, O> {
    /// Create a session with a custom observer.
    pub fn with_observer(
        connector: C,
        config: SessionConfig,
        registry: &'r HostTestRegistry,
        cancel: CancellationToken,
        observer: Arc<O>,
    ) -> Self {
        let host_test = registry.create_or_default(&config.host_test);
        let deadline = Instant::now() + config.default_timeout;
        Self {
            connector,
            config,
            observer,
            registry,
            cancel,
            transcript: Transcript::new(),
            walker: KvWalker::new(),
            host_test,
            callbacks: CallbackRegistry::new(),
            deadline,
            version: None,
            pending: Vec::new(),
        }
    }

    fn emit(&self, event: HtrEvent) {
        self.observer.on_event(&event);
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        self.transcript.push(HOST_TAG, Direction::Inf, message.clone());
        self.emit(HtrEvent::Log { level, message });
    }

    fn phase(&self, phase: HtrPhase) {
        self.emit(HtrEvent::PhaseChanged {
            target_id: self.config.target_id.clone(),
            phase,
        });
    }

    /// Run the session to completion and close the connector.
    #[instrument(skip(self), fields(target_id = %self.config.target_id))]
    pub fn run(mut self) -> SessionOutcome {
        let started = Instant::now();
        self.phase(HtrPhase::Connecting);

        let outcome = match self.install_host_test() {
            false => SuiteOutcome::Error,
            true => match self.sync() {
                Some(failure) => failure,
                None => {
                    self.phase(HtrPhase::Supervising);
                    self.supervise()
                }
            },
        };

        self.host_test.teardown();
        self.connector.close();

        // The post-hoc decoder reads the verdict from this line.
        self.transcript.push(
            HOST_TAG,
            Direction::Rxd,
            frame(KEY_RESULT, outcome.marker()).trim_end(),
        );
        info!(outcome = %outcome, host_test = %self.host_test.name(), "Session finished");

        SessionOutcome {
            outcome,
            duration: started.elapsed().as_secs_f64(),
            host_test: self.host_test.name().to_string(),
            version: self.version,
            transcript: self.transcript,
        }
    }

    fn install_host_test(&mut self) -> bool {
        let mut callbacks = CallbackRegistry::new();
        match self.host_test.setup(&mut callbacks) {
            Ok(()) => {
                self.callbacks = callbacks;
                true
            }
            Err(e) => {
                let msg = format!("Host test '{}' setup failed: {}", self.host_test.name(), e);
                self.log(LogLevel::Error, msg);
                false
            }
        }
    }

    fn send_kv(&mut self, key: &str, value: &str) -> bool {
        match self.connector.write_kv(key, value) {
            Some(frame) => {
                self.transcript
                    .push(CONN_TAG, Direction::Txd, frame.trim_end());
                self.emit(HtrEvent::KvSent { frame });
                true
            }
            None => {
                warn!(key = %key, error = ?self.connector.last_error(), "Failed to send KV");
                false
            }
        }
    }

    /// Exchange `__sync` tokens with the DUT. Returns the failure outcome,
    /// or `None` once synchronised.
    fn sync(&mut self) -> Option<SuiteOutcome> {
        if self.config.sync_packets == 0 {
            return None;
        }
        self.connector.flush();

        let deadline = Instant::now() + self.config.sync_timeout;
        let mut tokens = Vec::new();
        let mut sent = 0;
        let mut last_send: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Some(SuiteOutcome::Error);
            }
            if !self.connector.connected() {
                return Some(SuiteOutcome::IoerrSerial);
            }
            if Instant::now() >= deadline {
                self.log(LogLevel::Error, "DUT did not answer sync packets");
                return Some(SuiteOutcome::SyncFailed);
            }
            if sent < self.config.sync_packets
                && last_send.is_none_or(|t| t.elapsed() >= SYNC_RESEND_INTERVAL)
            {
                let token = Uuid::new_v4().to_string();
                if self.send_kv(KEY_SYNC, &token) {
                    tokens.push(token);
                }
                sent += 1;
                last_send = Some(Instant::now());
            }

            let data = self.connector.read(READ_CHUNK);
            if data.is_empty() {
                thread::sleep(IDLE_SLEEP);
                continue;
            }
            let mut lines = self.walker.feed(&data).into_iter();
            while let Some(line) = lines.next() {
                self.transcript.push(CONN_TAG, Direction::Rxd, line.clone());
                if let Some((key, value)) = parse_kv(&line) {
                    if key == KEY_SYNC && tokens.contains(&value) {
                        debug!(token = %value, "Sync acknowledged");
                        self.pending = lines.collect();
                        return None;
                    }
                }
            }
        }
    }

    fn supervise(&mut self) -> SuiteOutcome {
        self.deadline = Instant::now() + self.config.default_timeout;
        let mut exited = false;
        let mut pending = std::mem::take(&mut self.pending);

        let completion = 'outer: loop {
            for line in pending.drain(..) {
                match self.process_line(&line) {
                    LineStep::Continue => {}
                    LineStep::Complete(outcome) => break 'outer Some(outcome),
                    LineStep::Exit => {
                        exited = true;
                        break 'outer None;
                    }
                }
            }
            if self.cancel.is_cancelled() {
                self.log(LogLevel::Warn, "Session cancelled");
                break Some(SuiteOutcome::Error);
            }
            if Instant::now() >= self.deadline {
                self.log(LogLevel::Warn, "Supervision budget elapsed");
                break Some(SuiteOutcome::Timeout);
            }
            if !self.connector.connected() {
                let err = self.connector.last_error();
                self.log(LogLevel::Error, format!("Connection lost: {:?}", err));
                break Some(SuiteOutcome::IoerrSerial);
            }

            let data = self.connector.read(READ_CHUNK);
            if data.is_empty() {
                thread::sleep(IDLE_SLEEP);
                continue;
            }
            pending = self.walker.feed(&data);
        };

        let own_verdict = self.host_test.result();
        match completion {
            // A host test with its own failing verdict overrides a passing marker.
            Some(SuiteOutcome::Ok) if own_verdict == Some(false) => SuiteOutcome::Fail,
            Some(outcome) => outcome,
            None if exited => match own_verdict {
                Some(true) => SuiteOutcome::Ok,
                Some(false) => SuiteOutcome::Fail,
                None => SuiteOutcome::Undef,
            },
            None => SuiteOutcome::Undef,
        }
    }

    fn process_line(&mut self, line: &str) -> LineStep {
        let ts = self.transcript.push(CONN_TAG, Direction::Rxd, line);
        self.emit(HtrEvent::Line {
            text: line.to_string(),
        });

        let mut actions = HostActions::new();
        let Some((key, value)) = parse_kv(line) else {
            self.callbacks
                .dispatch(KEY_RXD_LINE, line, ts, &mut actions);
            return self.apply(actions);
        };
        self.emit(HtrEvent::KvReceived {
            key: key.clone(),
            value: value.clone(),
        });

        match key.as_str() {
            KEY_SYNC => {}
            KEY_TIMEOUT => match value.trim().parse::<u64>() {
                Ok(secs) => {
                    self.deadline = Instant::now() + Duration::from_secs(secs);
                    debug!(secs = secs, "Supervision budget set by DUT");
                }
                Err(_) => warn!(value = %value, "Invalid __timeout value"),
            },
            KEY_HOST_TEST_NAME => self.switch_host_test(&value),
            KEY_VERSION => self.version = Some(value),
            KEY_NOTIFY_COMPLETE => {
                let result = match value.trim() {
                    "true" | "1" | "success" => Some(true),
                    "false" | "0" | "failure" => Some(false),
                    _ => None,
                };
                actions.notify_complete(result);
            }
            KEY_EXIT => return LineStep::Exit,
            KEY_RESET_DUT | KEY_RESET => actions.reset_dut(),
            _ => {
                self.callbacks.dispatch(&key, &value, ts, &mut actions);
            }
        }
        self.apply(actions)
    }

    fn switch_host_test(&mut self, name: &str) {
        if self.host_test.name() == name {
            return;
        }
        if self.registry.create(name).is_none() {
            warn!(name = %name, "Unknown host test, using {}", DEFAULT_HOST_TEST);
        }
        self.host_test.teardown();
        self.host_test = self.registry.create_or_default(name);
        info!(host_test = %self.host_test.name(), "Host test selected");
        self.install_host_test();
    }

    /// Apply handler side effects in order: outbound frames, reset, logs,
    /// then completion.
    fn apply(&mut self, mut actions: HostActions) -> LineStep {
        for (key, value) in actions.take_outbound() {
            self.send_kv(&key, &value);
        }
        if actions.take_reset() {
            self.log(LogLevel::Info, "Resetting DUT on host test request");
            if !self.connector.reset() {
                warn!("DUT reset failed");
            }
        }
        for message in actions.take_messages() {
            self.log(LogLevel::Info, message);
        }
        match actions.completion() {
            Some(outcome) => LineStep::Complete(outcome),
            None => LineStep::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::transport::MockConnector;

    fn config(sync_packets: u32, timeout_ms: u64) -> SessionConfig {
        SessionConfig {
            target_id: "0240".into(),
            sync_packets,
            sync_timeout: Duration::from_millis(300),
            default_timeout: Duration::from_millis(timeout_ms),
            host_test: DEFAULT_HOST_TEST.into(),
        }
    }

    /// Mock DUT that answers the first `__sync` and then prints `lines`.
    fn dut_after_sync(lines: &[&str]) -> MockConnector {
        let mock = MockConnector::new();
        let mut script: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        mock.set_responder(move |written| {
            let line = written.trim_end().to_string();
            if line.starts_with("{{__sync;") {
                let mut out = vec![line];
                out.append(&mut script);
                out
            } else if line.starts_with("{{echo;") {
                vec![line]
            } else {
                Vec::new()
            }
        });
        mock
    }

    fn run(mock: MockConnector, cfg: SessionConfig) -> SessionOutcome {
        let registry = HostTestRegistry::with_builtins();
        HostTestSession::with_observer(
            mock,
            cfg,
            &registry,
            CancellationToken::new(),
            Arc::new(NullObserver),
        )
        .run()
    }

    #[test]
    fn test_end_marker_completes_session() {
        let mock = dut_after_sync(&[
            "{{__testcase_start;A}}",
            "{{__testcase_finish;A;1;0}}",
            "{{end;success}}",
            "{{never;dispatched}}",
        ]);
        let handle = mock.clone();

        let out = run(mock, config(1, 2000));
        assert_eq!(out.outcome, SuiteOutcome::Ok);
        assert_eq!(handle.close_count(), 1);
        assert!(handle.get_writes()[0].starts_with("{{__sync;"));

        let rendered = out.transcript.render();
        assert!(rendered.contains("[CONN][RXD] {{end;success}}"));
        assert!(!rendered.contains("never"));
        assert!(rendered.trim_end().ends_with("{{result;success}}"));
    }

    #[test]
    fn test_lines_in_sync_chunk_are_kept() {
        let mock = MockConnector::new();
        mock.set_responder(|written| {
            if written.starts_with("{{__sync;") {
                vec![format!("{}\n{{{{end;failure}}}}", written.trim_end())]
            } else {
                Vec::new()
            }
        });
        let out = run(mock, config(1, 2000));
        assert_eq!(out.outcome, SuiteOutcome::Fail);
    }

    #[test]
    fn test_sync_failure() {
        let mock = MockConnector::new();
        let out = run(mock, config(2, 2000));
        assert_eq!(out.outcome, SuiteOutcome::SyncFailed);
        assert!(out.transcript.render().contains("{{result;sync_failed}}"));
    }

    #[test]
    fn test_budget_elapses_to_timeout() {
        let mock = MockConnector::new();
        mock.queue_line("booting");
        let out = run(mock, config(0, 100));
        assert_eq!(out.outcome, SuiteOutcome::Timeout);
    }

    #[test]
    fn test_dut_timeout_overrides_budget() {
        let mock = MockConnector::new();
        mock.queue_line("{{__timeout;0}}");
        let started = Instant::now();
        let out = run(mock, config(0, 5000));
        assert_eq!(out.outcome, SuiteOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_connection_loss() {
        let mock = MockConnector::new();
        mock.disconnect();
        let out = run(mock, config(0, 2000));
        assert_eq!(out.outcome, SuiteOutcome::IoerrSerial);
    }

    #[test]
    fn test_cancellation() {
        let registry = HostTestRegistry::with_builtins();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = HostTestSession::with_observer(
            MockConnector::new(),
            config(0, 2000),
            &registry,
            cancel,
            Arc::new(NullObserver),
        )
        .run();
        assert_eq!(out.outcome, SuiteOutcome::Error);
    }

    #[test]
    fn test_echo_host_test_round_trip() {
        let mock = dut_after_sync(&["{{__host_test_name;echo}}", "{{echo_count;3}}"]);
        let handle = mock.clone();

        let out = run(mock, config(1, 500));
        // Nobody sends `end`, so the budget runs out after the exchange.
        assert_eq!(out.outcome, SuiteOutcome::Timeout);
        assert_eq!(out.host_test, "echo");
        let echoes = handle
            .get_writes()
            .iter()
            .filter(|w| w.starts_with("{{echo;"))
            .count();
        assert_eq!(echoes, 3);
        assert!(handle.get_writes().contains(&"{{echo_count;3}}\n".to_string()));
    }

    #[test]
    fn test_hello_host_test_completes_session() {
        let mock = MockConnector::new();
        mock.queue_line("{{__host_test_name;hello_auto}}");
        mock.queue_line("{{hello_world;Hello World}}");
        let out = run(mock, config(0, 2000));
        assert_eq!(out.host_test, "hello_auto");
        assert_eq!(out.outcome, SuiteOutcome::Ok);
    }

    #[test]
    fn test_exit_uses_host_test_verdict() {
        let mock = MockConnector::new();
        mock.queue_line("{{__version;1.3.0}}");
        mock.queue_line("{{__exit;0}}");
        let out = run(mock, config(0, 2000));
        assert_eq!(out.outcome, SuiteOutcome::Undef);
        assert_eq!(out.version.as_deref(), Some("1.3.0"));
    }

    #[test]
    fn test_reset_request_and_notify() {
        let mock = MockConnector::new();
        mock.queue_line("{{__reset_dut;0}}");
        mock.queue_line("{{__notify_complete;false}}");
        let handle = mock.clone();
        let out = run(mock, config(0, 2000));
        assert_eq!(handle.reset_count(), 1);
        assert_eq!(out.outcome, SuiteOutcome::Fail);
    }
}
