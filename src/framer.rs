//! Newline framing for worker output.
//!
//! Reads from a pipe end at arbitrary byte offsets, so the framer keeps the
//! unterminated tail of each chunk until a later chunk supplies the `\n`.
//! Lines are decoded as UTF-8 only once complete, which keeps multi-byte
//! characters split across reads intact.

use tracing::warn;

/// Longest line held in memory. Anything longer is discarded up to its
/// terminator.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct LineFramer {
    carry: Vec<u8>,
    limit: usize,
    /// Inside an over-long line; bytes are dropped until the next `\n`.
    discarding: bool,
    discarded: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            carry: Vec::new(),
            limit,
            discarding: false,
            discarded: 0,
        }
    }

    /// Appends `bytes` and returns every line completed by them, without the
    /// terminator. Whitespace-only lines are dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.append(&rest[..pos]);
            rest = &rest[pos + 1..];

            let raw = std::mem::take(&mut self.carry);
            if std::mem::replace(&mut self.discarding, false) {
                continue;
            }
            if let Some(line) = finish_line(&raw) {
                lines.push(line);
            }
        }

        self.append(rest);
        lines
    }

    /// Emits the trailing partial line, if any. Call once the stream is closed.
    pub fn flush(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.carry);
        if std::mem::replace(&mut self.discarding, false) {
            return None;
        }
        finish_line(&raw)
    }

    /// Number of lines dropped for exceeding the limit.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.discarding {
            return;
        }
        if self.carry.len() + bytes.len() > self.limit {
            warn!(
                limit = self.limit,
                held = self.carry.len() + bytes.len(),
                "worker output line too long, discarding it"
            );
            self.carry = Vec::new();
            self.discarding = true;
            self.discarded += 1;
            return;
        }
        self.carry.extend_from_slice(bytes);
    }

    /// Bytes currently held waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

fn finish_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    if line.trim().is_empty() {
        None
    } else {
        Some(line.into_owned())
    }
}
