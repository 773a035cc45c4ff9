//! Server-sent event decoding
//!
//! Splits upstream byte chunks into complete lines regardless of where the
//! transport cut them, so multi-byte characters survive chunk boundaries.

/// Terminal sentinel used by OpenAI-style streams
pub const DONE_MARKER: &str = "[DONE]";

/// Incremental line decoder for SSE bodies
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    pending: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Flush a trailing line that was not newline terminated
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Payload of a `data:` line. Vendors disagree on the space after the colon.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Every `data:` payload of a complete SSE body, in order
pub fn data_payloads(body: &[u8]) -> Vec<String> {
    let mut decoder = SseLineDecoder::new();
    let mut lines = decoder.push(body);
    lines.extend(decoder.finish());

    lines
        .iter()
        .filter_map(|line| data_payload(line))
        .filter(|payload| !payload.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let lines = decoder.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_multibyte_character_split() {
        let text = "data:世界\n".as_bytes();
        let mut decoder = SseLineDecoder::new();
        // cut inside the first character
        assert!(decoder.push(&text[..6]).is_empty());
        let lines = decoder.push(&text[6..]);
        assert_eq!(lines, vec!["data:世界"]);
    }

    #[test]
    fn test_data_payload_with_and_without_space() {
        assert_eq!(data_payload("data: {}"), Some("{}"));
        assert_eq!(data_payload("data:{}"), Some("{}"));
        assert_eq!(data_payload("event:result"), None);
        assert_eq!(data_payload(":HTTP_STATUS/200"), None);
    }

    #[test]
    fn test_crlf_and_trailing_line() {
        let payloads = data_payloads(b"id:1\r\ndata: one\r\n\r\ndata: two");
        assert_eq!(payloads, vec!["one", "two"]);
    }
}
