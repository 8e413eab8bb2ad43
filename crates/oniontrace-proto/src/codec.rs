//! CRLF line reassembly for the control connection.
//!
//! Control-protocol messages are lines terminated by `\r\n`. Reads from a
//! nonblocking socket can end anywhere, including between the `\r` and the
//! `\n` of a terminator, so incoming bytes are buffered until a complete
//! terminator has been seen.

use crate::err::ProtoError;

/// Accumulates raw socket bytes and yields complete lines.
///
/// Lines are returned without their terminator. Empty lines are consumed
/// silently, and a line that is not valid UTF-8 is discarded and reported.
#[derive(Debug, Default)]
pub struct LineBuffer {
    /// Bytes received but not yet returned as part of a complete line.
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Return a new, empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes freshly read from the socket.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Remove and return the next complete line, if one is buffered.
    ///
    /// Returns `None` when the buffered bytes do not yet contain a full
    /// `\r\n` terminator.
    pub fn next_line(&mut self) -> Option<Result<String, ProtoError>> {
        loop {
            let end = self.find_terminator()?;
            // Split the line (and its terminator) off the front of the buffer.
            let mut line = self.buf.split_off(end + 2);
            std::mem::swap(&mut line, &mut self.buf);
            line.truncate(end);
            if line.is_empty() {
                // An empty line carries no information; skip it.
                continue;
            }
            return Some(
                String::from_utf8(line).map_err(|e| ProtoError::NotUtf8(e.utf8_error())),
            );
        }
    }

    /// Number of buffered bytes not yet part of a complete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Find the offset of the next `\r\n`, if both bytes have arrived.
    ///
    /// A trailing lone `\r` is left in place: its `\n` may be the first
    /// byte of the next read.
    fn find_terminator(&self) -> Option<usize> {
        for pos in memchr::memchr_iter(b'\r', &self.buf) {
            match self.buf.get(pos + 1) {
                Some(b'\n') => return Some(pos),
                Some(_) => continue,
                None => return None,
            }
        }
        None
    }
}
