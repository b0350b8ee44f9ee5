//! Line reassembly and multi-line block framing for the pvdd stream.
//!
//! The daemon writes newline-terminated lines. Most messages fit on one line;
//! attribute payloads whose JSON spans several lines are wrapped between
//! `PVD_BEGIN_MULTILINE` and `PVD_END_MULTILINE` marker lines:
//!
//! ```text
//! PVD_BEGIN_MULTILINE
//! PVD_ATTRIBUTES foo.example.com
//! {
//!  "name": "foo"
//! }
//! PVD_END_MULTILINE
//! ```
//!
//! Markers are only recognised as exact full-line matches, so JSON content can
//! never be mistaken for one.

use thiserror::Error;

/// Opens a multi-line block.
pub const BEGIN_MULTILINE: &str = "PVD_BEGIN_MULTILINE";

/// Closes a multi-line block.
pub const END_MULTILINE: &str = "PVD_END_MULTILINE";

/// Largest line or multi-line block kept in memory (16MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing violations. The offending data is dropped and decoding resumes at
/// the next line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("multi-line block exceeds {limit} bytes")]
    BlockTooLarge { limit: usize },
}

/// One complete protocol unit, ready for interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A single-line message.
    Line(String),
    /// The `\n`-joined body of a multi-line block, markers excluded.
    Block(String),
}

impl Frame {
    pub fn as_str(&self) -> &str {
        match self {
            Frame::Line(text) | Frame::Block(text) => text,
        }
    }
}

/// Splits raw socket chunks into complete lines.
///
/// Bytes after the last `\n` of a chunk are kept until the rest of the line
/// arrives, so chunk boundaries never affect line boundaries. Lines are
/// returned as bytes; UTF-8 decoding happens per complete line so a multi-byte
/// character split across two reads is still decoded correctly.
#[derive(Debug)]
pub struct LineBuffer {
    partial: Vec<u8>,
    limit: usize,
    /// Set after an overflow until the end of the oversized line.
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_SIZE)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that refuses lines longer than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            partial: Vec::new(),
            limit,
            discarding: false,
        }
    }

    /// Append a chunk and return every line it completes.
    ///
    /// Returned lines have their trailing `\n` and `\r` removed. Empty lines
    /// are returned too; callers decide whether to skip them. A line growing
    /// past the limit yields one [`FrameError::LineTooLong`] and the rest of
    /// it is skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                let mut line = std::mem::take(&mut self.partial);
                while line.last() == Some(&b'\r') {
                    line.pop();
                }
                lines.push(Ok(line));
            } else if !self.discarding {
                if self.partial.len() >= self.limit {
                    self.partial = Vec::new();
                    self.discarding = true;
                    lines.push(Err(FrameError::LineTooLong { limit: self.limit }));
                    continue;
                }
                self.partial.push(byte);
            }
        }

        lines
    }

    /// Number of buffered bytes not yet terminated by `\n`.
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }
}

/// Reassembles multi-line blocks from a sequence of lines.
#[derive(Debug)]
pub struct FrameDecoder {
    in_multiline: bool,
    /// Only ever `Some` while `in_multiline` is set.
    pending: Option<String>,
    limit: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that drops blocks larger than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            in_multiline: false,
            pending: None,
            limit,
        }
    }

    /// Feed one line (without its terminator) and return the frame it
    /// completes, if any.
    ///
    /// The begin marker is checked first so that a block left open by a
    /// malformed stream is discarded rather than merged with the next one.
    /// A block outgrowing the limit is dropped, the decoder reset, and
    /// [`FrameError::BlockTooLarge`] returned.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<Frame>, FrameError> {
        if line == BEGIN_MULTILINE {
            if self.pending.is_some() {
                tracing::debug!("Discarding unterminated multi-line block");
            }
            self.in_multiline = true;
            self.pending = None;
            return Ok(None);
        }

        if line == END_MULTILINE {
            let block = self.pending.take();
            self.in_multiline = false;
            return Ok(block.filter(|b| !b.is_empty()).map(Frame::Block));
        }

        if self.in_multiline {
            let grown = self.pending.as_ref().map_or(0, |b| b.len() + 1) + line.len();
            if grown > self.limit {
                self.reset();
                return Err(FrameError::BlockTooLarge { limit: self.limit });
            }
            match self.pending.as_mut() {
                Some(block) => {
                    block.push('\n');
                    block.push_str(line);
                }
                None => self.pending = Some(line.to_string()),
            }
            return Ok(None);
        }

        Ok(Some(Frame::Line(line.to_string())))
    }

    /// Whether a multi-line block is currently open.
    pub fn in_multiline(&self) -> bool {
        self.in_multiline
    }

    /// Forget any partially received block.
    pub fn reset(&mut self) {
        self.in_multiline = false;
        self.pending = None;
    }
}
