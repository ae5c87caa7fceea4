//! Stdio framing: length-prefixed (`Content-Length` headers) or
//! newline-delimited JSON, detected from the first successfully parsed
//! request and mirrored on output.

use serde_json::Value;

/// Upper bound on buffered bytes. Exceeding it drops the whole buffer: an
/// explicit denial-of-service guard instead of unbounded growth.
pub const MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Upper bound on a single declared `Content-Length`.
pub const MAX_CONTENT_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    LengthPrefixed,
    NewlineDelimited,
}

/// Incremental frame decoder over an accumulating byte buffer.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    mode: Option<FramingMode>,
    max_buffer: usize,
    max_content_length: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Case-insensitive `Content-Length` lookup inside a header span.
fn content_length(headers: &str) -> Option<usize> {
    for line in headers.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse::<usize>().ok();
        }
    }
    None
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limits(MAX_BUFFER_BYTES, MAX_CONTENT_LENGTH)
    }

    pub fn with_limits(max_buffer: usize, max_content_length: usize) -> Self {
        Self {
            buffer: Vec::new(),
            mode: None,
            max_buffer,
            max_content_length,
        }
    }

    /// Framing mode observed on the first successfully parsed message.
    pub fn mode(&self) -> Option<FramingMode> {
        self.mode
    }

    /// Appends `chunk` and returns every complete JSON message now
    /// available. Malformed frames are discarded without aborting the
    /// stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.max_buffer {
            tracing::warn!(
                buffered = self.buffer.len(),
                "frame buffer limit exceeded; dropping buffer"
            );
            self.buffer.clear();
            return Vec::new();
        }

        let mut messages = Vec::new();
        loop {
            match self.next_step() {
                Step::Message(value) => messages.push(value),
                // A frame was consumed but yielded nothing; keep scanning.
                Step::Consumed => {}
                Step::NeedMore => break,
            }
        }
        messages
    }

    fn next_step(&mut self) -> Step {
        if self.mode != Some(FramingMode::NewlineDelimited) {
            let crlf = find_subsequence(&self.buffer, b"\r\n\r\n").map(|at| (at, 4usize));
            let lf = find_subsequence(&self.buffer, b"\n\n").map(|at| (at, 2usize));
            let header_end = match (crlf, lf) {
                (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
                (one, two) => one.or(two),
            };
            if let Some((end, sep_len)) = header_end {
                return self.consume_length_prefixed(end, sep_len);
            }
            // A header may still be arriving; do not misread its first line
            // as a newline-delimited message.
            if self.buffer_starts_with_header() {
                return Step::NeedMore;
            }
        }
        if self.mode == Some(FramingMode::LengthPrefixed) {
            return Step::NeedMore;
        }
        // Fallback: treat each whole line as one self-delimited JSON message.
        let Some(nl) = find_subsequence(&self.buffer, b"\n") else {
            return Step::NeedMore;
        };
        let line: Vec<u8> = self.buffer.drain(..=nl).collect();
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            return Step::Consumed;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                self.mode.get_or_insert(FramingMode::NewlineDelimited);
                Step::Message(value)
            }
            Err(_) => Step::Consumed,
        }
    }

    fn buffer_starts_with_header(&self) -> bool {
        let head = &self.buffer[..self.buffer.len().min(64)];
        let head = String::from_utf8_lossy(head);
        head.trim_start()
            .to_ascii_lowercase()
            .starts_with("content-length:")
    }

    fn consume_length_prefixed(&mut self, header_end: usize, sep_len: usize) -> Step {
        let headers = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();
        let Some(len) = content_length(&headers).filter(|n| *n <= self.max_content_length) else {
            // Malformed-frame recovery: drop the header span, keep going.
            self.buffer.drain(..header_end + sep_len);
            return Step::Consumed;
        };
        let body_start = header_end + sep_len;
        if self.buffer.len() < body_start + len {
            return Step::NeedMore;
        }
        let body: Vec<u8> = self.buffer.drain(..body_start + len).collect();
        let body = &body[body_start..];
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => {
                self.mode.get_or_insert(FramingMode::LengthPrefixed);
                Step::Message(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, "discarding unparsable frame body");
                Step::Consumed
            }
        }
    }
}

enum Step {
    Message(Value),
    Consumed,
    NeedMore,
}

/// Serializes one outgoing body in the given framing mode.
pub fn encode_frame(mode: FramingMode, body: &str) -> Vec<u8> {
    match mode {
        FramingMode::LengthPrefixed => {
            format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
        }
        FramingMode::NewlineDelimited => format!("{body}\n").into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn frame(value: &Value) -> Vec<u8> {
        let body = value.to_string();
        encode_frame(FramingMode::LengthPrefixed, &body)
    }

    #[test]
    fn length_prefixed_round_trip() {
        let mut decoder = FrameDecoder::new();
        let msg = json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}});
        let parsed = decoder.feed(&frame(&msg));
        assert_eq!(parsed, vec![msg]);
        assert_eq!(decoder.mode(), Some(FramingMode::LengthPrefixed));
    }

    #[test]
    fn newline_delimited_round_trip() {
        let mut decoder = FrameDecoder::new();
        let msg = json!({"jsonrpc":"2.0","id":7,"method":"tools/list"});
        let bytes = encode_frame(FramingMode::NewlineDelimited, &msg.to_string());
        let parsed = decoder.feed(&bytes);
        assert_eq!(parsed, vec![msg]);
        assert_eq!(decoder.mode(), Some(FramingMode::NewlineDelimited));
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut decoder = FrameDecoder::new();
        let msg = json!({"id":1,"method":"initialize"});
        let bytes = frame(&msg);
        let (head, tail) = bytes.split_at(10);
        assert!(decoder.feed(head).is_empty());
        assert_eq!(decoder.feed(tail), vec![msg]);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let a = json!({"id":1,"method":"a"});
        let b = json!({"id":2,"method":"b"});
        let mut bytes = frame(&a);
        bytes.extend(frame(&b));
        assert_eq!(decoder.feed(&bytes), vec![a, b]);
    }

    #[test]
    fn header_without_content_length_is_discarded() {
        let mut decoder = FrameDecoder::new();
        let msg = json!({"id":1,"method":"ok"});
        let mut bytes = b"X-Whatever: 3\r\n\r\n".to_vec();
        bytes.extend(frame(&msg));
        assert_eq!(decoder.feed(&bytes), vec![msg]);
    }

    #[test]
    fn oversized_declared_length_is_rejected_not_fatal() {
        let mut decoder = FrameDecoder::with_limits(MAX_BUFFER_BYTES, 16);
        let mut bytes = b"Content-Length: 999999\r\n\r\n".to_vec();
        let msg = json!({"id":1});
        bytes.extend(frame(&msg));
        assert_eq!(decoder.feed(&bytes), vec![msg]);
    }

    #[test]
    fn unparsable_body_is_swallowed() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = encode_frame(FramingMode::LengthPrefixed, "not json");
        bytes.extend(frame(&json!({"id":2})));
        assert_eq!(decoder.feed(&bytes), vec![json!({"id":2})]);
    }

    #[test]
    fn buffer_cap_drops_everything() {
        let mut decoder = FrameDecoder::with_limits(64, 32);
        let huge = vec![b'x'; 100];
        assert!(decoder.feed(&huge).is_empty());
        // Buffer was cleared; a fresh valid frame still parses.
        let msg = json!({"id":3});
        assert_eq!(decoder.feed(&frame(&msg)), vec![msg]);
    }

    #[test]
    fn empty_lines_are_ignored_in_newline_mode() {
        let mut decoder = FrameDecoder::new();
        let msg = json!({"id":4});
        let first = decoder.feed(format!("{msg}\n").as_bytes());
        assert_eq!(first, vec![msg.clone()]);
        assert!(decoder.feed(b"\n\n").is_empty());
        let again = decoder.feed(format!("{msg}\n").as_bytes());
        assert_eq!(again, vec![msg]);
    }

    #[test]
    fn lf_only_header_separator_is_accepted() {
        let mut decoder = FrameDecoder::new();
        let msg = json!({"id":5,"method":"x"});
        let body = msg.to_string();
        let bytes = format!("Content-Length: {}\n\n{body}", body.len());
        assert_eq!(decoder.feed(bytes.as_bytes()), vec![msg]);
    }
}
