//! Raw session transcript in `[ts][TAG][DIR] text` form.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Direction of a transcript line relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the device.
    Rxd,
    /// Transmitted to the device.
    Txd,
    /// Host-side annotation.
    Inf,
}

impl Direction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "RXD" => Some(Direction::Rxd),
            "TXD" => Some(Direction::Txd),
            "INF" => Some(Direction::Inf),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rxd => write!(f, "RXD"),
            Direction::Txd => write!(f, "TXD"),
            Direction::Inf => write!(f, "INF"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptLine {
    pub timestamp: f64,
    pub tag: String,
    pub direction: Direction,
    pub text: String,
}

impl TranscriptLine {
    /// Parse a rendered line. Lines without the `[ts][TAG][DIR] ` prefix are
    /// kept as received text with a zero timestamp.
    pub fn parse(line: &str) -> Self {
        Self::parse_prefixed(line).unwrap_or_else(|| TranscriptLine {
            timestamp: 0.0,
            tag: String::new(),
            direction: Direction::Rxd,
            text: line.to_string(),
        })
    }

    fn parse_prefixed(line: &str) -> Option<Self> {
        let (ts, rest) = bracketed(line)?;
        let timestamp = ts.parse::<f64>().ok()?;
        let (tag, rest) = bracketed(rest)?;
        let (dir, rest) = bracketed(rest)?;
        let direction = Direction::parse(dir)?;
        Some(TranscriptLine {
            timestamp,
            tag: tag.to_string(),
            direction,
            text: rest.strip_prefix(' ').unwrap_or(rest).to_string(),
        })
    }
}

fn bracketed(s: &str) -> Option<(&str, &str)> {
    let inner = s.strip_prefix('[')?;
    let end = inner.find(']')?;
    Some((&inner[..end], &inner[end + 1..]))
}

impl fmt::Display for TranscriptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.2}][{}][{}] {}",
            self.timestamp, self.tag, self.direction, self.text
        )
    }
}

/// Ordered capture of everything exchanged during a session.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    lines: Vec<TranscriptLine>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds since the Unix epoch.
    pub fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn push(&mut self, tag: &str, direction: Direction, text: impl Into<String>) -> f64 {
        let timestamp = Self::now();
        self.push_at(timestamp, tag, direction, text);
        timestamp
    }

    pub fn push_at(&mut self, timestamp: f64, tag: &str, direction: Direction, text: impl Into<String>) {
        self.lines.push(TranscriptLine {
            timestamp,
            tag: tag.to_string(),
            direction,
            text: text.into(),
        });
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Parse a captured log back into lines.
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text
                .lines()
                .map(|l| l.trim_end_matches('\r'))
                .filter(|l| !l.is_empty())
                .map(TranscriptLine::parse)
                .collect(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }
}
