//! Line demultiplexer for device console output.
//!
//! Raw chunks read from the transport are decoded, reassembled into complete
//! newline-terminated lines, cleaned of terminal escape sequences and
//! classified by their ESP-IDF style level prefix (`I `, `E `, `W `). Each
//! resulting [`LineEvent`] is handed to the [`ListenerChain`].
//!
//! Only complete lines are classified, so the events produced for a stream
//! do not depend on how the stream was split into chunks.

use crate::chain::ListenerChain;
use crate::sink::{Severity, lock};
use regex::Regex;
use std::sync::{Arc, LazyLock, Mutex};

/// Level markers, tested in this order. The first matching severity wins.
const LEVEL_MARKERS: &[(Severity, &[&str])] = &[
    (Severity::Info, &["I "]),
    (Severity::Error, &["E "]),
    (Severity::Success, &["I ", "W "]),
];

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\x1b|\[)?(?:\[|\()(?:\d{1,3};)*\d{1,3}[A-Za-z]")
        .unwrap_or_else(|err| panic!("invalid escape pattern: {err}"))
});

/// A classified console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    /// Line text with escapes and level marker removed.
    pub text: String,
    /// Severity derived from the level marker.
    pub severity: Severity,
}

/// Remove terminal colour/cursor sequences from `text`.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Severity implied by the level marker at the start of `text`.
pub fn severity_of(text: &str) -> Severity {
    LEVEL_MARKERS
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| text.starts_with(m)))
        .map_or(Severity::Info, |(severity, _)| *severity)
}

/// Strip the first matching level marker from `text`.
pub fn strip_level_marker(text: &str) -> &str {
    LEVEL_MARKERS
        .iter()
        .flat_map(|(_, markers)| markers.iter())
        .find_map(|marker| text.strip_prefix(marker))
        .unwrap_or(text)
}

/// Clean and classify a single line.
///
/// Returns `None` when nothing is left after cleaning.
pub fn classify_line(line: &str) -> Option<LineEvent> {
    let cleaned = strip_ansi(line.trim());
    let severity = severity_of(&cleaned);
    let text = strip_level_marker(&cleaned);
    if text.is_empty() {
        return None;
    }
    Some(LineEvent {
        text: text.to_string(),
        severity,
    })
}

/// Drain buffered bytes into text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Carry-over state for reassembling lines across chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    undecoded: Vec<u8>,
    partial: String,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk and return the events for every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LineEvent> {
        self.undecoded.extend_from_slice(chunk);
        let decoded = drain_utf8_lossy(&mut self.undecoded);
        self.partial.push_str(&decoded);

        let mut events = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            if let Some(event) = classify_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Text received after the last newline.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// Discard any partial line and undecoded bytes.
    pub fn clear(&mut self) {
        self.undecoded.clear();
        self.partial.clear();
    }
}

/// Shared demultiplexer feeding a [`ListenerChain`].
///
/// Dispatch happens while the buffer is held, so lines from concurrent
/// producers never interleave out of order.
#[derive(Debug, Clone)]
pub struct LineDemultiplexer {
    buffer: Arc<Mutex<LineBuffer>>,
    chain: ListenerChain,
}

impl LineDemultiplexer {
    /// Create a demultiplexer dispatching into `chain`.
    pub fn new(chain: ListenerChain) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LineBuffer::new())),
            chain,
        }
    }

    /// The chain receiving events.
    pub fn chain(&self) -> &ListenerChain {
        &self.chain
    }

    /// Feed a raw byte chunk. Returns the number of lines dispatched.
    pub fn push_bytes(&self, chunk: &[u8]) -> usize {
        let mut buffer = lock(&self.buffer);
        let events = buffer.push(chunk);
        for event in &events {
            self.chain.dispatch(&event.text, event.severity);
        }
        events.len()
    }

    /// Feed a chunk that is already a complete line of text.
    ///
    /// Returns `true` if the text survived cleaning and was dispatched.
    pub fn push_text(&self, text: &str) -> bool {
        let _buffer = lock(&self.buffer);
        match classify_line(text) {
            Some(event) => {
                self.chain.dispatch(&event.text, event.severity);
                true
            },
            None => false,
        }
    }

    /// Drop any partially received line (e.g. after the device rebooted).
    pub fn reset(&self) {
        lock(&self.buffer).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;

    fn event(text: &str, severity: Severity) -> LineEvent {
        LineEvent {
            text: text.to_string(),
            severity,
        }
    }

    const STREAM: &str = "\x1b[0;32mI (312) main: boot ok\x1b[0m\r\n\
                          E (400) wifi: connect failed\r\n\
                          W (401) wifi: retrying\n\
                          \n\
                          version: 1.2.3\n\
                          pubconsole>\n";

    fn expected_stream_events() -> Vec<LineEvent> {
        vec![
            event("(312) main: boot ok", Severity::Info),
            event("(400) wifi: connect failed", Severity::Error),
            event("(401) wifi: retrying", Severity::Success),
            event("version: 1.2.3", Severity::Info),
            event("pubconsole>", Severity::Info),
        ]
    }

    #[test]
    fn test_classify_markers() {
        assert_eq!(severity_of("E boom"), Severity::Error);
        assert_eq!(severity_of("I hello"), Severity::Info);
        assert_eq!(severity_of("W careful"), Severity::Success);
        assert_eq!(severity_of("plain"), Severity::Info);
        assert_eq!(severity_of("Error without marker"), Severity::Info);
    }

    #[test]
    fn test_classify_line_strips_marker_and_escapes() {
        assert_eq!(
            classify_line("  \x1b[0;31mE (10) app: bad\x1b[0m \r"),
            Some(event("(10) app: bad", Severity::Error))
        );
        assert_eq!(
            classify_line("W low battery"),
            Some(event("low battery", Severity::Success))
        );
    }

    #[test]
    fn test_marker_only_line_is_dropped() {
        assert_eq!(classify_line("I "), Some(event("I", Severity::Info)));
        assert_eq!(classify_line("   \r"), None);
        assert_eq!(classify_line("\x1b[0m"), None);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;32mgreen\x1b[0m"), "green");
        assert_eq!(strip_ansi("[0;33mbare"), "bare");
        assert_eq!(strip_ansi("(123) not an escape"), "(123) not an escape");
    }

    #[test]
    fn test_whole_stream_in_one_chunk() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(STREAM.as_bytes()), expected_stream_events());
        assert!(buffer.partial().is_empty());
    }

    #[test]
    fn test_every_two_way_split_matches_single_chunk() {
        let bytes = STREAM.as_bytes();
        for split in 0..=bytes.len() {
            let mut buffer = LineBuffer::new();
            let mut events = buffer.push(&bytes[..split]);
            events.extend(buffer.push(&bytes[split..]));
            assert_eq!(events, expected_stream_events(), "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_single_chunk() {
        let mut buffer = LineBuffer::new();
        let events: Vec<LineEvent> = STREAM
            .as_bytes()
            .iter()
            .flat_map(|b| buffer.push(std::slice::from_ref(b)))
            .collect();
        assert_eq!(events, expected_stream_events());
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let line = "I température ok\n".as_bytes();
        let cut = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(&line[..cut]).is_empty());
        assert_eq!(
            buffer.push(&line[cut..]),
            vec![event("température ok", Severity::Info)]
        );
    }

    #[test]
    fn test_partial_line_is_held_back() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"E (1) half").is_empty());
        assert_eq!(buffer.partial(), "E (1) half");
        buffer.clear();
        assert!(buffer.push(b" line\n").len() == 1);
    }

    #[test]
    fn test_drain_utf8_lossy_replaces_invalid_bytes_and_continues() {
        let mut buf = vec![0xFF, b'A', 0xFE, b'B'];
        let out = drain_utf8_lossy(&mut buf);
        assert_eq!(out, "�A�B");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_demultiplexer_dispatches_into_sink() {
        let sink = LogSink::new();
        let demux = LineDemultiplexer::new(ListenerChain::new(sink.clone()));

        assert_eq!(demux.push_bytes(b"I one\nE tw"), 1);
        assert_eq!(demux.push_bytes(b"o\n"), 1);
        assert!(demux.push_text("W three"));
        assert!(!demux.push_text("  "));

        let entries = sink.entries();
        let got: Vec<(&str, Severity)> = entries
            .iter()
            .map(|e| (e.message(), e.severity()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("one", Severity::Info),
                ("two", Severity::Error),
                ("three", Severity::Success),
            ]
        );
    }

    #[test]
    fn test_reset_drops_partial_line() {
        let sink = LogSink::new();
        let demux = LineDemultiplexer::new(ListenerChain::new(sink.clone()));
        demux.push_bytes(b"garbage before reboot");
        demux.reset();
        demux.push_bytes(b"fresh\n");
        assert_eq!(sink.entries()[0].message(), "fresh");
    }
}
