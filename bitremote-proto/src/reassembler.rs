//! Reassembly of newline-terminated lines from arbitrary notification fragments

use tracing::warn;

use crate::DEFAULT_MAX_LINE_LEN;

/// The receive buffer: complete lines are handed out as soon as their `\n`
/// arrives, at most one partial line stays behind.
///
/// Bytes are buffered raw so that a multi-byte UTF-8 character split across
/// two notifications decodes correctly once the line is complete.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line_len: usize,
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// A partial line longer than `max_line_len` is dropped up to its
    /// terminating newline.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self { buf: Vec::new(), max_line_len, discarding: false }
    }

    /// Append a fragment and iterate over the lines it completed.
    ///
    /// Lines are trimmed (this also removes `\r`); empty lines are skipped.
    /// Lines left unread when the iterator is dropped stay buffered and come
    /// out of the next call.
    pub fn feed(&mut self, fragment: &[u8]) -> Lines<'_> {
        self.buf.extend_from_slice(fragment);
        Lines { buffer: self }
    }

    /// Forget everything buffered, including a partial line.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    /// Bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max_line_len {
                    warn!(len = self.buf.len(), max = self.max_line_len, "line too long, discarding");
                    self.buf.clear();
                    self.discarding = true;
                }
                return None;
            };

            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let text = String::from_utf8_lossy(&raw[..pos]);
            let line = text.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy sequence of completed lines, see [`LineBuffer::feed`].
pub struct Lines<'a> {
    buffer: &'a mut LineBuffer,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.buffer.next_line()
    }
}
