use bytes::Bytes;

/// One server-sent event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// The OpenAI stream terminator sentinel.
    pub fn is_done(&self) -> bool {
        self.event.is_none() && self.data == "[DONE]"
    }

    /// Wire encoding, terminated by the blank record separator.
    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 16);
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Incremental SSE decoder. Upstream chunks may split events anywhere,
/// including inside a UTF-8 sequence, so undecodable tails are carried over.
#[derive(Debug, Default)]
pub struct SseParser {
    raw: Vec<u8>,
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.raw.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.raw) {
            Ok(_) => self.raw.len(),
            Err(err) => err.valid_up_to(),
        };
        if valid_up_to == 0 {
            return Vec::new();
        }
        let decoded: Vec<u8> = self.raw.drain(..valid_up_to).collect();
        // Safety of the unchecked variant was just established; stay checked anyway.
        match std::str::from_utf8(&decoded) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                self.flush_pending(&mut events);
            } else {
                self.consume_line(line);
            }
        }

        events
    }

    /// Drain whatever remains at end of stream (no trailing blank line).
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.trim_end_matches('\r').to_string();
            self.consume_line(&line);
        }
        self.flush_pending(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_pending(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events() {
        let mut parser = SseParser::new();
        let events =
            parser.push(b"event: message_start\ndata: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: hel").is_empty());
        assert!(parser.push(b"lo\n").is_empty());
        let events = parser.push(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn utf8_split_across_chunks() {
        let text = "data: héllo\n\n".as_bytes();
        let mut parser = SseParser::new();
        let split = 8; // inside the two-byte é
        assert!(text[split] & 0b1100_0000 == 0b1000_0000);
        let mut events = parser.push(&text[..split]);
        events.extend(parser.push(&text[split..]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn multiline_data_joined() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn comments_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.push(b": keep-alive\n\n").is_empty());
    }

    #[test]
    fn finish_flushes_tail() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn encode_roundtrips() {
        let event = SseEvent::named("content_block_delta", "{\"x\":1}");
        let bytes = event.encode();
        let mut parser = SseParser::new();
        let parsed = parser.push(&bytes);
        assert_eq!(parsed, vec![event]);
    }
}
