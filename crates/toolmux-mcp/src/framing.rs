//! Newline framing for the child's output stream.

/// Accumulates raw chunks and yields complete newline-terminated frames.
///
/// A chunk may carry zero, one or many frames plus a trailing partial frame;
/// the partial tail is kept and prefixed to the next chunk.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every frame it completes.
    ///
    /// Frames are returned without the delimiter; a trailing `\r` is
    /// stripped and blank frames are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut frame = &self.buf[start..end];
            if let Some(stripped) = frame.strip_suffix(b"\r") {
                frame = stripped;
            }
            if !frame.iter().all(u8::is_ascii_whitespace) {
                frames.push(frame.to_vec());
            }
            start = end + 1;
        }
        self.buf.drain(..start);
        frames
    }

    /// Bytes received that do not yet form a complete frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}
