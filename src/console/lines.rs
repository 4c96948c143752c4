//! Splitting a raw byte stream into console lines.

/// Lines longer than this are cut so a console spewing garbage without
/// newlines cannot grow the buffer without bound.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Accumulates bytes and yields complete lines, newline included.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns every line it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();

        for &byte in data {
            self.pending.push(byte);
            if byte == b'\n' || self.pending.len() >= MAX_LINE_LENGTH {
                lines.push(std::mem::take(&mut self.pending));
            }
        }

        lines
    }

    /// Returns whatever is buffered without a terminating newline.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// Strips trailing `\n` / `\r\n` (and stray `\r`) from a line.
pub fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}
