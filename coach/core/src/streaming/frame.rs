//! Frame Reader
//!
//! Reassembles the chunked response body into newline-terminated frames.
//!
//! # Frame Format
//!
//! ```text
//! data: {"type":"content","content":"Hel"}\n
//! \n
//! data: {"type":"content","content":"lo"}\n
//! ```
//!
//! Network reads split this arbitrarily: in the middle of a line, in the middle
//! of a multi-byte character, or several lines at once. The reader keeps the
//! incomplete tail between calls and only hands out complete lines.
//!
//! # Decoding
//!
//! Splitting happens on the raw `0x0A` byte. That byte never occurs inside a
//! multi-byte UTF-8 sequence, so every complete line is decoded exactly once
//! and a character split across chunks is simply completed by the next read.
//!
//! # Limits
//!
//! - The retained tail is bounded by `max_frame_bytes`
//! - An oversized frame is dropped up to its newline and reported once
//! - A line that is not valid UTF-8 is reported and skipped; later lines are unaffected

use tracing::{debug, warn};

use super::error::StreamError;

/// Default bound on a single frame (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Minimum buffer capacity for the reader
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Incremental line framer for the response body
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Bytes before this position hold no newline
    scan_pos: usize,
    max_frame_bytes: usize,
    /// Dropping an oversized frame until its newline
    discarding: bool,
    discarded_bytes: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    /// Create a reader with the default frame bound
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a reader with a custom frame bound
    #[must_use]
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
            max_frame_bytes: max_frame_bytes.max(1),
            discarding: false,
            discarded_bytes: 0,
        }
    }

    /// Append a chunk and iterate the frames it completes
    ///
    /// The iterator is lazy: frames not pulled before it is dropped stay
    /// buffered and are yielded by the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.compact();
        self.buffer.extend_from_slice(chunk);
        Frames { reader: self }
    }

    /// Number of buffered bytes not yet returned as frames
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// End of input: drop any incomplete tail
    ///
    /// Returns the number of bytes discarded. A trailing line without a
    /// newline is never emitted as a frame.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending();
        if dropped > 0 {
            warn!(bytes = dropped, "Discarding incomplete frame at end of stream");
        }
        self.buffer.clear();
        self.read_pos = 0;
        self.scan_pos = 0;
        self.discarding = false;
        self.discarded_bytes = 0;
        dropped
    }

    fn compact(&mut self) {
        if self.read_pos == self.buffer.len() {
            self.buffer.clear();
            self.read_pos = 0;
            self.scan_pos = 0;
        } else if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos -= self.read_pos;
            self.read_pos = 0;
        }
    }

    fn next_frame(&mut self) -> Option<Result<String, StreamError>> {
        let scan_from = self.scan_pos.max(self.read_pos);
        let newline = self.buffer[scan_from..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|offset| scan_from + offset);

        let Some(end) = newline else {
            self.scan_pos = self.buffer.len();
            if self.discarding || self.pending() > self.max_frame_bytes {
                // Keep nothing of an oversized frame
                self.discarding = true;
                self.discarded_bytes += self.pending();
                self.read_pos = self.buffer.len();
            }
            return None;
        };

        let start = self.read_pos;
        self.read_pos = end + 1;
        self.scan_pos = self.read_pos;

        if self.discarding {
            let total = self.discarded_bytes + (end - start);
            self.discarding = false;
            self.discarded_bytes = 0;
            return Some(Err(self.oversized(total)));
        }

        let mut line = &self.buffer[start..end];
        if line.len() > self.max_frame_bytes {
            return Some(Err(self.oversized(line.len())));
        }
        if let [rest @ .., b'\r'] = line {
            line = rest;
        }

        match std::str::from_utf8(line) {
            Ok(text) => {
                debug!(bytes = line.len(), "Frame complete");
                Some(Ok(text.to_owned()))
            }
            Err(e) => Some(Err(StreamError::FrameDecode(format!(
                "invalid UTF-8 in frame: {e}"
            )))),
        }
    }

    fn oversized(&self, len: usize) -> StreamError {
        StreamError::FrameDecode(format!(
            "frame of {len} bytes exceeds maximum {}",
            self.max_frame_bytes
        ))
    }
}

/// Complete frames produced by one [`FrameReader::feed`] call
#[derive(Debug)]
pub struct Frames<'a> {
    reader: &'a mut FrameReader,
}

impl Iterator for Frames<'_> {
    type Item = Result<String, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_frame()
    }
}
