//! Line-oriented server-sent-event framing.

/// One flushed event: the kind from the last `event:` line (empty when
/// none was sent) and the `data:` lines joined with `\n`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental decoder. Feed it arbitrary chunks; complete frames come out
/// as soon as their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    // raw bytes so a UTF-8 sequence split across chunks survives
    line_buf: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.push_bytes(chunk.as_bytes())
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.line_buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.line_buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.line_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(frame) = self.feed_line(line.trim_end_matches(['\n', '\r'])) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is buffered at end of input (a final frame without its
    /// blank line).
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.line_buf.is_empty() {
            let raw = std::mem::take(&mut self.line_buf);
            let line = String::from_utf8_lossy(&raw);
            if let Some(frame) = self.feed_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.flush()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.flush();
        }
        if let Some(event) = line.strip_prefix("event:") {
            self.event = event.strip_prefix(' ').unwrap_or(event).to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // comments (":") and unknown fields (id, retry) are ignored
        None
    }

    fn flush(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event.clear();
            return None;
        }
        let frame = SseFrame {
            event: std::mem::take(&mut self.event),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(frame)
    }
}

/// Decode a complete SSE body in one go.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut decoder = SseDecoder::new();
    let mut frames = decoder.push(raw);
    frames.extend(decoder.finish());
    frames
}

/// Render one frame in wire form, terminated by the blank line.
pub fn encode_frame(event: &str, data: &str) -> String {
    let mut out = String::with_capacity(event.len() + data.len() + 16);
    if !event.is_empty() {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data() {
        let frames = parse_sse_lines("event: session-started\ndata: {\"sessionId\":\"w1\"}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame { event: "session-started".into(), data: "{\"sessionId\":\"w1\"}".into() }]
        );
    }

    #[test]
    fn multiple_data_lines_are_joined() {
        let frames = parse_sse_lines("event: assistant\ndata: {\"a\":\ndata: 1}\n\n");
        assert_eq!(frames[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn kind_is_cleared_after_flush() {
        let frames = parse_sse_lines("event: error\ndata: x\n\ndata: y\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "error");
        assert_eq!(frames[1].event, "");
    }

    #[test]
    fn split_chunks_and_crlf() {
        let mut d = SseDecoder::new();
        assert!(d.push("event: res").is_empty());
        assert!(d.push("ult\r\ndata: {\"type\":").is_empty());
        let frames = d.push("\"result\"}\r\n\r\n");
        assert_eq!(frames, vec![SseFrame { event: "result".into(), data: "{\"type\":\"result\"}".into() }]);
    }

    #[test]
    fn utf8_split_across_chunks() {
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.len() - 3; // inside the two-byte é
        let mut d = SseDecoder::new();
        assert!(d.push_bytes(&bytes[..split]).is_empty());
        let frames = d.push_bytes(&bytes[split..]);
        assert_eq!(frames[0].data, "caf\u{e9}");
    }

    #[test]
    fn trailing_frame_without_blank_line() {
        let mut d = SseDecoder::new();
        assert!(d.push("event: result\ndata: {}").is_empty());
        assert_eq!(d.finish(), Some(SseFrame { event: "result".into(), data: "{}".into() }));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        assert!(parse_sse_lines("\n\n: keepalive\n\nevent: ping\n\n").is_empty());
    }

    #[test]
    fn encode_then_decode() {
        let wire = encode_frame("plan-pending", "{\"plan\":\"a\nb\"}");
        assert!(wire.ends_with("\n\n"));
        let frames = parse_sse_lines(&wire);
        assert_eq!(frames[0].event, "plan-pending");
        assert_eq!(frames[0].data, "{\"plan\":\"a\nb\"}");
    }
}
