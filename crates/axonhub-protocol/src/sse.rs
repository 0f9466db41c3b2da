use bytes::Bytes;

/// One parsed server-sent event: optional `event:` name plus the joined
/// `data:` payload (multi-line data is joined with `\n`, per the SSE spec).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
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

    /// The `data: [DONE]` terminator used by OpenAI-compatible streams.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE decoder. Feed arbitrary byte chunks; complete events are
/// returned as soon as their terminating blank line arrives. Unknown fields
/// (`id:`, `retry:`) and comment lines are discarded.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    scan_from: usize,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        loop {
            let Some(end) = self.find_frame_end() else {
                break;
            };
            let frame: Vec<u8> = self.buffer.drain(..end.frame_len).collect();
            self.buffer.drain(..end.separator_len);
            self.scan_from = 0;
            if let Some(event) = parse_frame(&frame) {
                events.push(event);
            }
        }
        events
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        self.push(chunk.as_ref())
    }

    /// Flush a trailing frame that was never terminated by a blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.scan_from = 0;
        parse_frame(&rest).into_iter().collect()
    }

    fn find_frame_end(&mut self) -> Option<FrameEnd> {
        // A frame ends at the first blank line: "\n\n", "\r\n\r\n" or the
        // mixed forms. Scan resumes where the previous call left off.
        let buf = &self.buffer;
        let mut i = self.scan_from;
        while i < buf.len() {
            if buf[i] != b'\n' {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            if j < buf.len() && buf[j] == b'\r' {
                j += 1;
            }
            if j < buf.len() && buf[j] == b'\n' {
                return Some(FrameEnd {
                    frame_len: i,
                    separator_len: j + 1 - i,
                });
            }
            if j >= buf.len() {
                // Might still become a blank line once more bytes arrive.
                self.scan_from = i;
                return None;
            }
            i += 1;
        }
        self.scan_from = buf.len();
        None
    }
}

struct FrameEnd {
    frame_len: usize,
    separator_len: usize,
}

fn parse_frame(frame: &[u8]) -> Option<SseEvent> {
    let text = std::str::from_utf8(frame).ok()?;
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = (!value.is_empty()).then(|| value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

/// Encode one event as a wire frame. Multi-line data gets one `data:` line
/// per payload line.
pub fn encode_sse(event: Option<&str>, data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + 16);
    if let Some(event) = event {
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
    Bytes::from(out)
}

pub fn encode_done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}
