//! Buffering decoder for the run event stream.
//!
//! Records are separated by a blank line. Inside a record, `data:` lines carry
//! the JSON payload; several `data:` lines are joined with `\n`. Comment lines
//! (leading `:`) and any other field are ignored, as is a record without data.
//! Input may be split at any byte, so incomplete lines stay buffered until the
//! next `feed`.

use tracing::warn;

use crate::types::RunEvent;

const DONE_SENTINEL: &str = "[DONE]";

/// Default cap on one record's buffered bytes.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// One decoder per connection; it holds no state shared with other streams.
///
/// A record whose buffered line or joined data grows past the record limit is
/// dropped whole and counted in [`WireCodec::discarded`]; decoding resumes at
/// the next record.
#[derive(Debug)]
pub struct WireCodec {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    record_bytes: usize,
    record_limit: usize,
    oversized: bool,
    skipping_line: bool,
    discarded: u64,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::with_record_limit(MAX_RECORD_BYTES)
    }
}

impl WireCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_record_limit(record_limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            data_lines: Vec::new(),
            record_bytes: 0,
            record_limit: record_limit.max(1),
            oversized: false,
            skipping_line: false,
            discarded: 0,
        }
    }

    /// Consumes a chunk and returns every record it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RunEvent> {
        let mut events = Vec::new();
        let mut rest = chunk;
        while !rest.is_empty() {
            let newline = rest.iter().position(|byte| *byte == b'\n');
            if self.skipping_line {
                let Some(offset) = newline else {
                    break;
                };
                self.skipping_line = false;
                rest = &rest[offset + 1..];
                continue;
            }

            let Some(offset) = newline else {
                if self.buffer.len() + rest.len() > self.record_limit {
                    self.buffer.clear();
                    self.skipping_line = true;
                    self.drop_record();
                } else {
                    self.buffer.extend_from_slice(rest);
                }
                break;
            };
            let (line, tail) = (&rest[..offset], &rest[offset + 1..]);
            rest = tail;
            if self.buffer.len() + line.len() > self.record_limit {
                self.buffer.clear();
                self.drop_record();
                continue;
            }
            self.buffer.extend_from_slice(line);
            let line = String::from_utf8_lossy(strip_carriage_return(&self.buffer)).into_owned();
            self.buffer.clear();
            if let Some(event) = self.consume_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing record left without its closing blank line.
    pub fn finish(&mut self) -> Option<RunEvent> {
        self.skipping_line = false;
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(strip_carriage_return(&self.buffer)).into_owned();
            self.buffer.clear();
            if let Some(event) = self.consume_line(&line) {
                return Some(event);
            }
        }
        self.dispatch_record()
    }

    /// Payloads dropped because they were not valid event JSON or were over
    /// the record limit.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn consume_line(&mut self, line: &str) -> Option<RunEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return self.dispatch_record();
        }
        if trimmed.starts_with(':') || self.oversized {
            return None;
        }
        if let Some(raw) = trimmed.strip_prefix("data:") {
            let raw = raw.trim_start();
            self.record_bytes = self.record_bytes.saturating_add(raw.len() + 1);
            if self.record_bytes > self.record_limit {
                self.drop_record();
                return None;
            }
            self.data_lines.push(raw.to_string());
        }
        None
    }

    /// Forgets the current record and ignores its remaining lines.
    fn drop_record(&mut self) {
        self.data_lines.clear();
        self.record_bytes = 0;
        if self.oversized {
            return;
        }
        self.oversized = true;
        self.discarded = self.discarded.saturating_add(1);
        warn!(limit = self.record_limit, "run stream payload discarded: record over size limit");
    }

    fn dispatch_record(&mut self) -> Option<RunEvent> {
        self.record_bytes = 0;
        if std::mem::take(&mut self.oversized) || self.data_lines.is_empty() {
            self.data_lines.clear();
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();

        let payload = payload.trim();
        if payload.is_empty() || payload == DONE_SENTINEL {
            return None;
        }
        match serde_json::from_str::<RunEvent>(payload) {
            Ok(event) => Some(event),
            Err(error) => {
                self.discarded = self.discarded.saturating_add(1);
                warn!(error = %error, payload = %payload, "run stream payload discarded");
                None
            }
        }
    }
}

fn strip_carriage_return(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_records_separated_by_blank_lines() {
        let mut codec = WireCodec::new();
        let events = codec.feed(
            b"data: {\"type\":\"status\",\"message\":\"planning\",\"ts\":\"T0\"}\n\n\
              data: {\"type\":\"log\",\"message\":\"found 3 files\",\"ts\":\"T1\",\"details\":{\"n\":3}}\n\n",
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "status");
        assert_eq!(events[0].message, "planning");
        assert_eq!(events[1].timestamp, "T1");
        assert_eq!(events[1].details, Some(serde_json::json!({"n": 3})));
    }

    #[test]
    fn buffers_partial_records_across_chunks() {
        let mut codec = WireCodec::new();
        let wire = "data: {\"type\":\"log\",\"message\":\"héllo\",\"ts\":\"T0\"}\n\n".as_bytes();

        let mut events = Vec::new();
        for byte in wire {
            events.extend(codec.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "héllo");
    }

    #[test]
    fn accepts_crlf_framing_and_multi_line_data() {
        let mut codec = WireCodec::new();
        let events = codec.feed(
            b": keepalive\r\n\r\nevent: update\r\ndata: {\"type\":\"log\",\r\ndata: \"message\":\"x\",\"ts\":\"T0\"}\r\n\r\n",
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "x");
    }

    #[test]
    fn malformed_payloads_are_skipped_without_stopping() {
        let mut codec = WireCodec::new();
        let events = codec.feed(
            b"data: {not json}\n\n\
              data: [DONE]\n\n\
              id: 7\n\n\
              data: {\"type\":\"log\",\"message\":\"after\",\"ts\":\"T2\"}\n\n",
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "after");
        assert_eq!(codec.discarded(), 1);
    }

    #[test]
    fn finish_flushes_unterminated_record() {
        let mut codec = WireCodec::new();
        assert!(
            codec
                .feed(b"data: {\"type\":\"status\",\"message\":\"completed\",\"ts\":\"T3\"}")
                .is_empty()
        );
        let event = codec.finish().expect("trailing event");
        assert_eq!(event.message, "completed");
        assert!(codec.finish().is_none());
    }

    #[test]
    fn fresh_codec_carries_nothing_from_previous_connection() {
        let mut first = WireCodec::new();
        assert!(first.feed(b"data: {\"type\":\"log\",").is_empty());

        let mut second = WireCodec::new();
        let events = second.feed(b"data: {\"type\":\"log\",\"message\":\"m\",\"ts\":\"T\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(second.discarded(), 0);
    }

    #[test]
    fn oversized_record_is_dropped_and_decoding_resumes() {
        let mut codec = WireCodec::with_record_limit(64);
        let long = "x".repeat(200);
        let wire = format!(
            "data: {{\"type\":\"log\",\"message\":\"{long}\",\"ts\":\"T0\"}}\n\n\
             data: {{\"type\":\"log\",\"message\":\"after\",\"ts\":\"T1\"}}\n\n"
        );

        let events = codec.feed(wire.as_bytes());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "after");
        assert_eq!(codec.discarded(), 1);
    }

    #[test]
    fn many_data_lines_count_toward_the_record_limit() {
        let mut codec = WireCodec::with_record_limit(64);
        let mut wire = "data: aaaaaaaaaaaaaaaaaaaa\n".repeat(5);
        wire.push_str("data: more\n\ndata: {\"type\":\"log\",\"message\":\"m\",\"ts\":\"T\"}\n\n");

        let events = codec.feed(wire.as_bytes());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "m");
        assert_eq!(codec.discarded(), 1);
    }

    #[test]
    fn unterminated_line_is_not_buffered_past_the_limit() {
        let mut codec = WireCodec::with_record_limit(64);
        let filler = [b'x'; 100];
        for _ in 0..10 {
            assert!(codec.feed(&filler).is_empty());
            assert!(codec.buffer.len() <= 64);
        }

        let events = codec.feed(b"\n\ndata: {\"type\":\"log\",\"message\":\"m\",\"ts\":\"T\"}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "m");
        assert_eq!(codec.discarded(), 1);
        assert!(codec.buffer.is_empty());
    }
}
