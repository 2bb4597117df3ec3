use std::collections::VecDeque;
use std::str::Utf8Error;

/// Longest line kept while waiting for its terminator
pub const DEFAULT_MAX_LINE: usize = 1024 * 1024;

const PREFIX_BYTES: usize = 256;

/// A complete line whose bytes were not valid UTF-8
#[derive(Debug, Clone)]
pub struct InvalidLine {
    pub lossy: String,
    pub error: Utf8Error,
}

/// A line that could not be handed out as text
#[derive(Debug, Clone)]
pub enum LineError {
    InvalidUtf8(InvalidLine),
    /// The line grew past the limit without a terminator; the rest of it
    /// is skipped up to the next `\n`
    TooLong { limit: usize, prefix: String },
}

/// Carry-over buffer for line-based parsing
///
/// Bytes are appended as chunks arrive; complete lines (terminated by `\n`,
/// with an optional `\r` before it) are drained from the front. The trailing
/// partial line stays buffered until the next chunk completes it, which also
/// covers multi-byte UTF-8 sequences split across chunks.
pub struct LineBuffer {
    buffer: VecDeque<u8>,
    // Bytes before this offset are known not to contain `\n`.
    scanned: usize,
    max_line: usize,
    // Inside an oversized line that was already reported
    skipping: bool,
}

impl LineBuffer {
    /// Create a new buffer with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            scanned: 0,
            max_line: DEFAULT_MAX_LINE,
            skipping: false,
        }
    }

    /// Lines longer than `max_line` bytes are dropped
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    /// Add bytes to the buffer
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes);
    }

    /// Extract next complete line, without its terminator.
    /// Returns None if no complete line is available
    pub fn next_line(&mut self) -> Option<Result<String, LineError>> {
        loop {
            let offset = self
                .buffer
                .iter()
                .skip(self.scanned)
                .position(|&b| b == b'\n');

            let Some(offset) = offset else {
                if self.skipping {
                    self.clear_bytes();
                    return None;
                }
                if self.buffer.len() > self.max_line {
                    return Some(Err(self.overflow()));
                }
                self.scanned = self.buffer.len();
                return None;
            };

            let newline_pos = self.scanned + offset;
            let mut line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            self.scanned = 0;

            if self.skipping {
                self.skipping = false;
                continue;
            }
            line_bytes.pop();
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.pop();
            }
            if line_bytes.len() > self.max_line {
                line_bytes.truncate(PREFIX_BYTES);
                return Some(Err(LineError::TooLong {
                    limit: self.max_line,
                    prefix: String::from_utf8_lossy(&line_bytes).into_owned(),
                }));
            }
            return Some(decode(line_bytes));
        }
    }

    /// Drain whatever is left as a final, unterminated line
    pub fn take_remainder(&mut self) -> Option<Result<String, LineError>> {
        if self.skipping {
            self.clear();
            return None;
        }
        if self.buffer.is_empty() {
            return None;
        }
        let mut line_bytes: Vec<u8> = self.buffer.drain(..).collect();
        self.scanned = 0;
        if line_bytes.last() == Some(&b'\r') {
            line_bytes.pop();
        }
        Some(decode(line_bytes))
    }

    pub fn clear(&mut self) {
        self.clear_bytes();
        self.skipping = false;
    }

    fn clear_bytes(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    fn overflow(&mut self) -> LineError {
        let prefix: Vec<u8> = self.buffer.iter().take(PREFIX_BYTES).copied().collect();
        self.clear_bytes();
        self.skipping = true;
        LineError::TooLong {
            limit: self.max_line,
            prefix: String::from_utf8_lossy(&prefix).into_owned(),
        }
    }

    /// Current buffer size
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_capacity(4096)
    }
}

fn decode(bytes: Vec<u8>) -> Result<String, LineError> {
    String::from_utf8(bytes).map_err(|e| {
        LineError::InvalidUtf8(InvalidLine {
            lossy: String::from_utf8_lossy(e.as_bytes()).into_owned(),
            error: e.utf8_error(),
        })
    })
}
