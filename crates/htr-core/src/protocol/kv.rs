//! `{{key;value}}` framing and line reassembly.

use super::constants::{FIELD_SEP, FRAME_CLOSE, FRAME_OPEN, MAX_FRAME_LEN, MAX_LINE_LEN};

/// One decoded telemetry event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub key: String,
    pub value: String,
    /// Seconds since the Unix epoch (or since stream start for offline logs).
    pub timestamp: f64,
}

impl EventMessage {
    pub fn new(key: impl Into<String>, value: impl Into<String>, timestamp: f64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
        }
    }

    /// Value split on the field separator.
    pub fn fields(&self) -> Vec<&str> {
        self.value.split(FIELD_SEP).collect()
    }
}

/// Build the wire frame for a KV pair, including the trailing newline.
pub fn frame(key: &str, value: &str) -> String {
    format!("{FRAME_OPEN}{key}{FIELD_SEP}{value}{FRAME_CLOSE}\n")
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Extract the first `{{key;value}}` (or bare `{{key}}`) frame from a line.
///
/// Returns `None` for lines that carry no well-formed frame.
pub fn parse_kv(line: &str) -> Option<(String, String)> {
    let mut search_from = 0;
    while let Some(rel) = line[search_from..].find(FRAME_OPEN) {
        let open = search_from + rel;
        let body = &line[open + FRAME_OPEN.len()..];
        if let Some(parsed) = parse_body(body) {
            return Some(parsed);
        }
        search_from = open + 1;
    }
    None
}

fn parse_body(body: &str) -> Option<(String, String)> {
    let key_len = body.find(|c: char| !is_key_char(c))?;
    if key_len == 0 {
        return None;
    }
    let key = &body[..key_len];
    let rest = &body[key_len..];

    if rest.starts_with(FRAME_CLOSE) {
        return Some((key.to_string(), String::new()));
    }

    let value_part = rest.strip_prefix(FIELD_SEP)?;
    let mut close = value_part.find(FRAME_CLOSE)?;
    // A value ending in '}' pushes the real close further right.
    while value_part[close + FRAME_CLOSE.len()..].starts_with('}') {
        close += 1;
    }
    Some((key.to_string(), value_part[..close].to_string()))
}

/// Reassembles a byte stream into complete text lines.
///
/// Bytes are buffered until a newline so multibyte characters split across
/// reads decode intact. `\r` is stripped. A line is cut at [`MAX_LINE_LEN`]
/// so a device that never prints a newline cannot grow the buffer without
/// bound, except while a `{{` frame is open, where the cut is
/// [`MAX_FRAME_LEN`].
#[derive(Debug, Default)]
pub struct KvWalker {
    buffer: Vec<u8>,
    prev: Option<u8>,
    frame_open: bool,
}

impl KvWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and return every line completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in data {
            match b {
                b'\n' => lines.push(self.take_line()),
                b'\r' => {}
                b => {
                    match (self.prev, b) {
                        (Some(b'{'), b'{') => self.frame_open = true,
                        (Some(b'}'), b'}') => self.frame_open = false,
                        _ => {}
                    }
                    self.prev = Some(b);
                    self.buffer.push(b);
                    let limit = if self.frame_open {
                        MAX_FRAME_LEN
                    } else {
                        MAX_LINE_LEN
                    };
                    if self.buffer.len() >= limit {
                        lines.push(self.take_line());
                    }
                }
            }
        }
        lines
    }

    /// Flush any trailing partial line.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        self.prev = None;
        self.frame_open = false;
        let line = std::mem::take(&mut self.buffer);
        match String::from_utf8(line) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}
