//! SSE (Server-Sent Events) framing
//!
//! Incremental decoder for `text/event-stream` bodies read off a backend,
//! used by both the legacy SSE transport and streamable-HTTP responses.

use bytes_buffer::LineBuffer;

/// One dispatched SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field; `None` means the default `message` type
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Event type with the SSE default applied
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }

    pub fn is_message(&self) -> bool {
        self.event_type() == "message"
    }
}

/// Incremental SSE decoder
///
/// Feed arbitrary byte chunks; complete events come out as soon as their
/// terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    pending: SseEvent,
    has_data: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and collect every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        self.lines.push(chunk);
        while let Some(line) = self.lines.next_line() {
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an event left without its terminating blank line at end of stream
    pub fn finish(&mut self) -> Option<SseEvent> {
        if let Some(line) = self.lines.take_remainder() {
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            "id" => self.pending.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data {
            self.pending = SseEvent::default();
            return None;
        }
        self.has_data = false;
        Some(std::mem::take(&mut self.pending))
    }
}

mod bytes_buffer {
    /// Splits a byte stream into UTF-8 lines on `\n`, `\r\n` or `\r`
    #[derive(Debug, Default)]
    pub struct LineBuffer {
        buf: Vec<u8>,
        skip_lf: bool,
    }

    impl LineBuffer {
        pub fn push(&mut self, chunk: &[u8]) {
            self.buf.extend_from_slice(chunk);
        }

        pub fn next_line(&mut self) -> Option<String> {
            if self.skip_lf && self.buf.first() == Some(&b'\n') {
                self.buf.remove(0);
                self.skip_lf = false;
            }

            let pos = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r')?;
            let terminator = self.buf[pos];
            let line: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();

            if terminator == b'\r' {
                if self.buf.first() == Some(&b'\n') {
                    self.buf.remove(0);
                } else if self.buf.is_empty() {
                    // The matching \n may arrive in the next chunk
                    self.skip_lf = true;
                }
            } else {
                self.skip_lf = false;
            }

            Some(String::from_utf8_lossy(&line).into_owned())
        }

        pub fn take_remainder(&mut self) -> Option<String> {
            if self.buf.is_empty() {
                return None;
            }
            let rest = std::mem::take(&mut self.buf);
            Some(String::from_utf8_lossy(&rest).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: endpoint\ndata: /message?sessionId=abc\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "endpoint");
        assert_eq!(events[0].data, "/message?sessionId=abc");
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"jsonrpc\":").is_empty());
        assert!(decoder.feed(b"\"2.0\"}\r").is_empty());
        let events = decoder.feed(b"\n\r\n");

        assert_eq!(events.len(), 1);
        assert!(events[0].is_message());
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\nid: 42\ndata: first\ndata: second\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "first\nsecond");
        assert_eq!(events[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn test_event_without_data_is_dropped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: ping\n\n").is_empty());
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());

        let event = decoder.finish();
        assert_eq!(event.map(|e| e.data), Some("tail".to_string()));
    }
}
