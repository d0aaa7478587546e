//! Frame Decoder
//!
//! Incremental decoder for the `data:`-framed event stream carried in a
//! streaming POST response body.
//!
//! # Wire Format
//!
//! ```text
//! data: <payload-text>\n\n
//! ...
//! data: [DONE]\n\n
//! ```
//!
//! - Lines end with `\n` or `\r\n`; both are accepted in the same stream
//! - A line is an event only if, trimmed, it starts with `data:`
//! - One space after the colon is stripped, never more
//! - `[DONE]` ends the logical stream and is never delivered as content
//! - Blank lines, and lines that are not `data:` lines, carry nothing
//!
//! # Chunk Boundaries
//!
//! A network read can split the stream anywhere: inside a payload, inside a
//! `\r\n` pair, or inside a multi-byte UTF-8 sequence. The decoder holds
//! incomplete trailing bytes and the partial last line across calls to
//! [`FrameDecoder::feed`], so the frame sequence never depends on how the
//! bytes were chunked.

/// Prefix marking an event line
pub const DATA_PREFIX: &str = "data:";

/// Payload that terminates the logical stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Minimum capacity of the text buffer
const MIN_BUFFER_CAPACITY: usize = 1024;

/// One decoded line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Content carried by a `data:` line
    Payload(String),
    /// The end-of-stream marker
    Sentinel,
    /// A line with no content (blank, comment, or non-`data:` field)
    Blank,
}

impl Frame {
    /// Payload text, if this frame carries content
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Payload(text) => Some(text),
            _ => None,
        }
    }
}

/// Classify one complete line (without its terminator)
#[must_use]
pub fn parse_line(line: &str) -> Frame {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let trimmed = line.trim_start();

    let Some(rest) = trimmed.strip_prefix(DATA_PREFIX) else {
        return Frame::Blank;
    };
    let content = rest.strip_prefix(' ').unwrap_or(rest);

    if content.trim().is_empty() {
        Frame::Blank
    } else if content.trim_end() == DONE_SENTINEL {
        Frame::Sentinel
    } else {
        Frame::Payload(content.to_string())
    }
}

/// Streaming decoder state
///
/// Owns the text buffer and the undecoded byte tail for one response.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Bytes of an incomplete UTF-8 sequence at the end of the last chunk
    pending: Vec<u8>,
    /// Unconsumed text: always the partial last line
    buffer: String,
    /// Total bytes fed
    bytes_fed: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(4),
            buffer: String::with_capacity(MIN_BUFFER_CAPACITY),
            bytes_fed: 0,
        }
    }

    /// The partial line currently held
    #[must_use]
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Total bytes fed so far
    #[must_use]
    pub fn bytes_fed(&self) -> usize {
        self.bytes_fed
    }

    /// Feed one raw chunk and return the frames of every line it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.bytes_fed += chunk.len();
        self.decode_text(chunk);
        self.drain_lines()
    }

    /// Flush at end of transport
    ///
    /// Incomplete UTF-8 bytes are decoded lossily and a non-empty trailing
    /// line is treated as if one more line boundary had arrived.
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }

        let mut frames = self.drain_lines();
        if !self.buffer.trim().is_empty() {
            frames.push(parse_line(&self.buffer));
        }
        self.buffer.clear();
        frames
    }

    /// Drop all buffered state
    pub fn clear(&mut self) {
        self.pending.clear();
        self.buffer.clear();
    }

    /// Append the decodable prefix of `pending + chunk` to the text buffer
    fn decode_text(&mut self, chunk: &[u8]) {
        let owned;
        let mut bytes: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(chunk);
            owned = joined;
            &owned
        };

        loop {
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // `valid_up_to` marks a UTF-8 boundary
                    if let Ok(text) = std::str::from_utf8(&bytes[..valid]) {
                        self.buffer.push_str(text);
                    }
                    match e.error_len() {
                        // Sequence cut by the chunk boundary: wait for more
                        None => {
                            self.pending.extend_from_slice(&bytes[valid..]);
                            return;
                        }
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            bytes = &bytes[valid + len..];
                        }
                    }
                }
            }
        }
    }

    /// Split off every complete line in the buffer
    fn drain_lines(&mut self) -> Vec<Frame> {
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let frames = self.buffer[..last_newline]
            .split('\n')
            .map(parse_line)
            .collect();
        self.buffer.drain(..=last_newline);
        frames
    }
}

/// Decode a complete body in one pass
///
/// Equivalent to feeding the bytes as one chunk and finishing.
#[must_use]
pub fn decode_all(body: &[u8]) -> Vec<Frame> {
    let mut decoder = FrameDecoder::new();
    let mut frames = decoder.feed(body);
    frames.extend(decoder.finish());
    frames
}
