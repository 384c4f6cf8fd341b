//! Incremental decoding of the answer stream.
//!
//! The endpoint answers with blank-line separated frames, each one `data: `
//! followed by a generation payload. Bytes arrive in arbitrary network chunks,
//! so the decoder buffers partial UTF-8 sequences and partial frames until
//! they are complete.

use serde::Deserialize;
use tracing::debug;

const FRAME_DELIMITER: &str = "\n\n";
const DATA_PREFIX: &str = "data: ";

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    text: Option<String>,
}

impl GenerateResponse {
    /// `candidates[0].content.parts[0].text`
    fn into_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence
    pending_bytes: Vec<u8>,
    /// Decoded text not yet terminated by a frame delimiter
    buffer: String,
    bytes_received: usize,
    frames_parsed: usize,
    frames_dropped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk, returning the fragments of every frame it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.bytes_received += bytes.len();
        self.decode_utf8(bytes);
        self.drain_frames()
    }

    /// Flush whatever is left once the byte stream has ended.
    ///
    /// A final frame the server did not terminate with a blank line is still
    /// decoded.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.pending_bytes.clear();
            self.append_text(&tail);
        }

        let mut fragments = self.drain_frames();
        let rest = std::mem::take(&mut self.buffer);
        if !rest.trim().is_empty() {
            fragments.extend(self.decode_frame(&rest));
        }
        fragments
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn frames_parsed(&self) -> usize {
        self.frames_parsed
    }

    pub fn frames_dropped(&self) -> usize {
        self.frames_dropped
    }

    fn decode_utf8(&mut self, bytes: &[u8]) {
        self.pending_bytes.extend_from_slice(bytes);

        let mut decoded = String::with_capacity(self.pending_bytes.len());
        let mut rest: &[u8] = &self.pending_bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    decoded.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    decoded.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence: wait for the next chunk
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending_bytes.len() - rest.len();
        self.pending_bytes.drain(..consumed);
        self.append_text(&decoded);
    }

    fn append_text(&mut self, text: &str) {
        // CRLF streams frame the same as LF streams
        self.buffer.extend(text.chars().filter(|c| *c != '\r'));
    }

    fn drain_frames(&mut self) -> Vec<String> {
        let mut fragments = Vec::new();
        while let Some(pos) = self.buffer.find(FRAME_DELIMITER) {
            let frame: String = self.buffer.drain(..pos + FRAME_DELIMITER.len()).collect();
            if let Some(text) = self.decode_frame(&frame[..pos]) {
                fragments.push(text);
            }
        }
        fragments
    }

    fn decode_frame(&mut self, frame: &str) -> Option<String> {
        let frame = frame.trim_start_matches('\n');
        let Some(payload) = frame.strip_prefix(DATA_PREFIX) else {
            if !frame.is_empty() {
                debug!(len = frame.len(), "Skipping non-data frame");
            }
            return None;
        };

        match serde_json::from_str::<GenerateResponse>(payload) {
            Ok(response) => {
                self.frames_parsed += 1;
                response.into_text().filter(|text| !text.is_empty())
            }
            Err(e) => {
                self.frames_dropped += 1;
                debug!(error = %e, "Dropping malformed frame");
                None
            }
        }
    }
}
