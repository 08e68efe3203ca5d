//! Newline-delimited event-record decoding for the chat stream and the
//! generation push channel.
//!
//! Chunks arrive at arbitrary byte boundaries: one chunk may split a line
//! (even mid-character), or carry several lines. The decoder buffers the
//! partial tail and emits one raw JSON payload per recognized `data: ` line;
//! everything else is skipped.

/// Marker prefixing every event record on the wire.
pub const EVENT_PREFIX: &[u8] = b"data: ";

#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, appending each complete record payload to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<String>) {
        self.buffer.extend_from_slice(chunk);
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            if let Some(payload) = extract_payload(&self.buffer[start..end]) {
                out.push(payload);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
    }

    /// Flush the trailing line once the stream has completed.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        extract_payload(&line)
    }
}

fn extract_payload(line: &[u8]) -> Option<String> {
    let line = match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    };
    let payload = line.strip_prefix(EVENT_PREFIX)?;
    let payload = String::from_utf8_lossy(payload);
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    Some(payload.to_string())
}

/// Parse one record payload. Malformed JSON is logged and skipped; a single
/// bad record never fails the stream.
pub fn parse_record<T: serde::de::DeserializeOwned>(payload: &str) -> Option<T> {
    match serde_json::from_str(payload) {
        Ok(record) => Some(record),
        Err(err) => {
            log::warn!("Skipping malformed stream record: {} ({})", err, payload);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<String> {
        let mut decoder = LineDecoder::new();
        let mut out = Vec::new();
        for chunk in chunks {
            decoder.feed(chunk, &mut out);
        }
        if let Some(tail) = decoder.finish() {
            out.push(tail);
        }
        out
    }

    #[test]
    fn test_multiple_records_in_one_chunk() {
        let out = decode_chunks(&[b"data: {\"a\":1}\ndata: {\"b\":2}\n"]);
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_chunk_boundary_independence() {
        // Persian text forces multi-byte characters, so splits can land
        // inside a character.
        let stream: &[u8] =
            "data: {\"a\":\"\u{0633}\u{0644}\u{0627}\u{0645}\"}\nignored\ndata: {\"b\":2}\n\ndata: {\"c\":3}\n"
                .as_bytes();
        let whole = decode_chunks(&[stream]);
        assert_eq!(whole.len(), 3);
        assert_eq!(whole[0], "{\"a\":\"\u{0633}\u{0644}\u{0627}\u{0645}\"}");

        // Splitting the same logical stream at every byte boundary must
        // yield the identical record sequence.
        for split in 1..stream.len() {
            let (head, tail) = stream.split_at(split);
            assert_eq!(decode_chunks(&[head, tail]), whole, "split at {}", split);
        }

        // One byte per chunk.
        let bytes: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(decode_chunks(&bytes), whole);
    }

    #[test]
    fn test_unmarked_and_empty_lines_skipped() {
        let out = decode_chunks(&[b"event: ping\n", b"data: \n", b"\r\n", b"data: {\"x\":1}\n"]);
        assert_eq!(out, vec!["{\"x\":1}"]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let out = decode_chunks(&[b"data: {\"a\":1}\r\ndata: {\"b\":2}\r\n"]);
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_trailing_record_without_newline() {
        let out = decode_chunks(&[b"data: {\"a\":1}\ndata: {\"b\":2}"]);
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        #[derive(serde::Deserialize)]
        struct Rec {
            #[allow(dead_code)]
            a: u32,
        }
        assert!(parse_record::<Rec>("{\"a\":1}").is_some());
        assert!(parse_record::<Rec>("{not json").is_none());
    }
}
