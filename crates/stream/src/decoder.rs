/// Splits a byte stream into JSON frames.
///
/// Accepts newline-delimited JSON as well as `text/event-stream` bodies:
/// `data:` prefixes are stripped, and blank lines, SSE comments and SSE
/// control fields are treated as keep-alives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk and returns every frame completed by it.
    ///
    /// An incomplete trailing line stays buffered until the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut line_start = 0;
        while let Some(offset) = self.buffer[line_start..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let line_end = line_start + offset;
            if let Some(frame) = frame_from_line(&self.buffer[line_start..line_end]) {
                frames.push(frame);
            }
            line_start = line_end + 1;
        }

        self.buffer.drain(..line_start);
        frames
    }

    /// Flushes the buffered tail at end of body.
    pub fn finish(&mut self) -> Vec<String> {
        let tail = std::mem::take(&mut self.buffer);
        frame_from_line(&tail).into_iter().collect()
    }
}

fn frame_from_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();

    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let payload = match line.strip_prefix("data:") {
        Some(data) => data.trim_start(),
        None if is_sse_control_field(line) => return None,
        None => line,
    };

    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    Some(payload.to_string())
}

fn is_sse_control_field(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let mut decoder = FrameDecoder::new();

        assert!(decoder.push(br#"{"type":"content_ch"#).is_empty());
        let frames = decoder.push(b"unk\",\"content\":\"Hel\"}\n{\"type\":\"search_started\"}\n");

        assert_eq!(
            frames,
            vec![
                r#"{"type":"content_chunk","content":"Hel"}"#.to_string(),
                r#"{"type":"search_started"}"#.to_string(),
            ]
        );
    }

    #[test]
    fn sse_framing_and_keep_alives_are_stripped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(
            b": ping\r\nevent: message\r\ndata: {\"type\":\"search_started\"}\r\n\r\ndata: [DONE]\n",
        );

        assert_eq!(frames, vec![r#"{"type":"search_started"}"#.to_string()]);
    }

    #[test]
    fn unterminated_tail_is_flushed_at_end_of_body() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(br#"{"type":"search_complete"}"#).is_empty());
        assert_eq!(
            decoder.finish(),
            vec![r#"{"type":"search_complete"}"#.to_string()]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn multibyte_text_split_mid_character_survives() {
        let frame = "{\"type\":\"content_chunk\",\"content\":\"Druck \u{2264} 250\"}\n";
        let bytes = frame.as_bytes();
        let split = frame.find('\u{2264}').expect("marker present") + 1;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec![frame.trim_end().to_string()]);
    }
}
