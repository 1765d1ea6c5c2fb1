//! Incremental newline framing for byte streams.
//!
//! Process stdout arrives in arbitrary chunks. A record may be split across
//! any number of reads, including in the middle of a multi-byte character, so
//! bytes are buffered until a newline arrives and only then decoded.

/// Splits a byte stream into complete newline-terminated records.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Bytes of `buf` already known not to contain a newline.
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every record it completed, in order.
    ///
    /// Blank lines are skipped and a trailing `\r` is stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut pos = self.scanned;
        while let Some(offset) = self.buf[pos..].iter().position(|&b| b == b'\n') {
            let end = pos + offset;
            if let Some(line) = decode(&self.buf[start..end]) {
                lines.push(line);
            }
            start = end + 1;
            pos = start;
        }

        self.buf.drain(..start);
        self.scanned = self.buf.len();
        lines
    }

    /// Flush a final record that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buf);
        decode(&rest)
    }

    /// Number of buffered bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
