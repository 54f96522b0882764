//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow flashing, supervision and
//! decoding progress without coupling to the engine internals.

use std::fmt;

use crate::outcome::SuiteOutcome;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases a single task execution walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtrPhase {
    /// Copying the image onto the device.
    Flashing,
    /// Waiting for the device to prove it rebooted into the new image.
    Verifying,
    /// Opening the transport and synchronising with the DUT.
    Connecting,
    /// Dispatching telemetry until the suite completes.
    Supervising,
    /// Reconstructing the suite result from the transcript.
    Decoding,
    /// Task finished.
    Complete,
}

impl fmt::Display for HtrPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HtrPhase::Flashing => write!(f, "Flashing"),
            HtrPhase::Verifying => write!(f, "Verifying"),
            HtrPhase::Connecting => write!(f, "Connecting"),
            HtrPhase::Supervising => write!(f, "Supervising"),
            HtrPhase::Decoding => write!(f, "Decoding"),
            HtrPhase::Complete => write!(f, "Complete"),
        }
    }
}

/// Events emitted while executing tasks.
#[derive(Debug, Clone)]
pub enum HtrEvent {
    /// Phase changed for a device.
    PhaseChanged {
        target_id: String,
        phase: HtrPhase,
    },
    /// KV message received from the DUT.
    KvReceived { key: String, value: String },
    /// KV frame sent to the DUT.
    KvSent { frame: String },
    /// Raw line received from the DUT.
    Line { text: String },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// A suite finished on a device.
    SuiteComplete {
        target_id: String,
        test_name: String,
        outcome: SuiteOutcome,
        duration: f64,
    },
}

/// Observer trait for receiving engine events.
pub trait HtrObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &HtrEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl HtrObserver for NullObserver {
    fn on_event(&self, _event: &HtrEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl HtrObserver for TracingObserver {
    fn on_event(&self, event: &HtrEvent) {
        match event {
            HtrEvent::PhaseChanged { target_id, phase } => {
                tracing::info!(target_id = %target_id, phase = %phase, "Phase changed");
            }
            HtrEvent::KvReceived { key, value } => {
                tracing::debug!(key = %key, value = %value, "KV received");
            }
            HtrEvent::KvSent { frame } => {
                tracing::debug!(frame = %frame.trim_end(), "KV sent");
            }
            HtrEvent::Line { text } => {
                tracing::trace!("{}", text);
            }
            HtrEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            HtrEvent::SuiteComplete {
                target_id,
                test_name,
                outcome,
                duration,
            } => {
                tracing::info!(
                    target_id = %target_id,
                    test = %test_name,
                    outcome = %outcome,
                    duration = %format!("{:.2}s", duration),
                    "Suite complete"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records every event for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub events: Mutex<Vec<HtrEvent>>,
    }

    impl HtrObserver for RecordingObserver {
        fn on_event(&self, event: &HtrEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(HtrPhase::Supervising.to_string(), "Supervising");
    }

    #[test]
    fn test_recording_observer() {
        let obs = RecordingObserver::default();
        obs.on_event(&HtrEvent::KvSent {
            frame: "{{a;b}}\n".into(),
        });
        TracingObserver.on_event(&HtrEvent::Line { text: "x".into() });
        assert_eq!(obs.events.lock().unwrap().len(), 1);
    }
}
