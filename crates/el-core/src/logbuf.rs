//! Log line utilities: sanitization, partial-line reassembly, bounded history

use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;

/// Default ring buffer capacity for job and run logs
pub const DEFAULT_LOG_CAPACITY: usize = 500;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI_ESCAPE is a valid pattern")
});

static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").expect("CONTROL_CHARS is a valid pattern")
});

/// Strip ANSI escape sequences and non-printable control bytes from a log
/// line. Valid UTF-8 text passes through untouched; the function never fails.
pub fn sanitize(line: &str) -> String {
    if line.is_empty() {
        return String::new();
    }
    let cleaned = ANSI_ESCAPE.replace_all(line, "");
    CONTROL_CHARS.replace_all(&cleaned, "").into_owned()
}

/// Accumulates raw text chunks and yields only complete lines.
///
/// Lines are terminated by `\n`, `\r`, or `\r\n`; a trailing partial line is
/// retained across calls until a terminator arrives. Terminators are stripped
/// from the yielded lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    rest: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning all newly-completed lines in order.
    ///
    /// A chunk ending in a bare `\r` completes its line immediately; if the
    /// matching `\n` arrives at the start of the next chunk it yields one
    /// empty line, so the concatenation of all yielded lines is unaffected
    /// by where chunk boundaries fall.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.rest.push_str(chunk);
        let buf = std::mem::take(&mut self.rest);
        let bytes = buf.as_bytes();

        let mut out = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\n' => {
                    out.push(buf[start..i].to_string());
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    out.push(buf[start..i].to_string());
                    i += 1;
                    if i < bytes.len() && bytes[i] == b'\n' {
                        i += 1;
                    }
                    start = i;
                }
                _ => i += 1,
            }
        }
        self.rest = buf[start..].to_string();
        out
    }

    /// Drain any retained partial line, without requiring a terminator.
    pub fn flush(&mut self) -> Option<String> {
        if self.rest.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.rest))
        }
    }
}

/// Fixed-capacity FIFO of log lines; oldest entries are silently dropped
/// once full, insertion order is preserved.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<String>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, line: impl Into<String>) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(line.into());
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        for line in lines {
            self.append(line);
        }
    }

    /// Snapshot of the retained lines in insertion order
    pub fn list(&self) -> Vec<String> {
        self.buf.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
