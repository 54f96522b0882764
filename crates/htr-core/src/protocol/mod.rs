//! Protocol module - KV telemetry framing, reserved keys and transcripts.

pub mod constants;
pub mod kv;
pub mod transcript;

pub use constants::*;
pub use kv::{EventMessage, KvWalker, frame, parse_kv};
pub use transcript::{Direction, Transcript, TranscriptLine};
