//! Incremental server-sent-events framing.
//!
//! The decoder tolerates chunks split at arbitrary byte boundaries; bytes
//! that do not yet form a complete line stay buffered until the next push.

use bytes::Bytes;

pub const DONE_DATA: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data == DONE_DATA
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(line) = self.take_line() {
            self.consume_line(&line, &mut frames);
        }
        frames
    }

    /// Flush whatever remains buffered; upstreams are not required to end
    /// the stream with a blank line.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            self.consume_field(&line);
        }
        self.flush_frame(&mut frames);
        frames
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.find('\n')?;
        let mut line: String = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    fn consume_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.flush_frame(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        self.consume_field(line);
    }

    fn consume_field(&mut self, line: &str) {
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending_event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "data" => self.pending_data.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_frame(&mut self, frames: &mut Vec<SseFrame>) {
        if self.pending_event.is_none() && self.pending_data.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.pending_event.take(),
            data: self.pending_data.join("\n"),
        });
        self.pending_data.clear();
    }
}

/// Encode one `data: <payload>\n\n` frame.
pub fn data_frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// The `data: [DONE]\n\n` stream terminator.
pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}
