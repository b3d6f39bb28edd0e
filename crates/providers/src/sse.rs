/// Line-oriented SSE reader for OpenAI-compatible chat streams.
///
/// Providers send one `data: <json>` line per delta and finish with `data: [DONE]`.
/// Bytes are buffered until a full line is available, so multi-byte characters and
/// JSON payloads split across network chunks are reassembled before decoding.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Payload of a `data:` line.
    Data(String),
    /// The `[DONE]` terminator.
    Done,
}

#[derive(Default)]
pub struct SseLineParser {
    pending: Vec<u8>,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the response body. Returns every complete data line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = Self::decode(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseLine> {
        let raw = std::mem::take(&mut self.pending);
        Self::decode(&raw)
    }

    fn decode(raw: &[u8]) -> Option<SseLine> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches('\r');
        // event:, id:, retry: and ":" comments carry nothing we use
        let data = line.strip_prefix("data:")?.trim_start();
        if data.is_empty() {
            None
        } else if data == "[DONE]" {
            Some(SseLine::Done)
        } else {
            Some(SseLine::Data(data.to_string()))
        }
    }
}
