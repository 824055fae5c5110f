//! Message framing codec.
//!
//! A message on the wire is a run of transfer-encoded bytes terminated by a
//! single 0x0A. Within a message, fields are separated by single spaces.
//! [`MessageBuffer`] is both the builder for outgoing messages and the
//! parser for received ones; the transfer encoding keeps the terminator
//! byte out of message bodies:
//!
//! | decoded | encoded |
//! |---------|---------|
//! | `0x5C`  | `0x5C 0x2F` |
//! | `0x0A`  | `0x5C 0x6E` |

use crate::error::{Error, Result};

/// Byte that terminates a message on the wire.
pub const MESSAGE_TERMINATOR: u8 = 0x0A;

/// Byte that separates fields within a decoded message.
const FIELD_DELIMITER: u8 = 0x20;

/// Growable byte buffer with an independent read cursor.
///
/// Writers self-separate: each one prepends a single space iff the buffer
/// is non-empty. Readers consume up to (and past) the next delimiter and
/// fail with [`Error::EndOfInput`] once the cursor has moved beyond the
/// end.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
    pos_read: usize,
}

impl MessageBuffer {
    /// Empty buffer for composing an outgoing message.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            pos_read: 0,
        }
    }

    /// Wrap exactly one received message, undoing the transfer encoding.
    ///
    /// `encoded` must not contain the terminator; the reassembly layer
    /// strips it before handing frames down here.
    pub fn from_received(encoded: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(encoded.len());
        let mut pos = 0;
        while pos < encoded.len() {
            let b = encoded[pos];
            pos += 1;
            if b != b'\\' {
                buf.push(b);
                continue;
            }
            // An escape pair. Unknown successors are dropped together with
            // the backslash, as is a backslash with no successor at all.
            if pos < encoded.len() {
                match encoded[pos] {
                    b'n' => buf.push(0x0A),
                    b'/' => buf.push(b'\\'),
                    _ => {}
                }
                pos += 1;
            }
        }
        Self { buf, pos_read: 0 }
    }

    /// Append a text field: trimmed, line endings normalized to LF, UTF-8.
    pub fn write_string(&mut self, s: &str) {
        let normalized = trim_and_normalize(s);
        self.write_bytes(normalized.as_bytes());
    }

    /// Append the decimal string representation of an integer field.
    pub fn write_decimal(&mut self, n: u64) {
        self.write_string(&n.to_string());
    }

    /// Append a binary field exactly as given.
    pub fn write_bytes(&mut self, b: &[u8]) {
        if !self.buf.is_empty() {
            self.buf.push(FIELD_DELIMITER);
        }
        self.buf.extend_from_slice(b);
    }

    /// Read from the cursor up to (excluding) the next delimiter.
    ///
    /// Advances past the delimiter; adjacent delimiters yield an empty
    /// field. The final field runs to the end of the buffer.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        if self.pos_read >= self.buf.len() {
            return Err(Error::EndOfInput);
        }
        let rest = &self.buf[self.pos_read..];
        let len = rest
            .iter()
            .position(|&b| b == FIELD_DELIMITER)
            .unwrap_or(rest.len());
        let out = rest[..len].to_vec();
        self.pos_read += len + 1;
        Ok(out)
    }

    /// Read everything from the cursor to the end of the buffer.
    ///
    /// Unlike [`read_bytes`](Self::read_bytes) this succeeds (with an empty
    /// result) when the cursor sits exactly at the end.
    pub fn read_bytes_until_end(&mut self) -> Result<Vec<u8>> {
        let remaining = self
            .buf
            .len()
            .checked_sub(self.pos_read)
            .ok_or(Error::EndOfInput)?;
        let out = self.buf[self.pos_read..].to_vec();
        self.pos_read += remaining + 1;
        Ok(out)
    }

    /// Read the next field as text: UTF-8 (lossy), trimmed, line endings
    /// normalized to LF.
    pub fn read_string(&mut self) -> Result<String> {
        Ok(decode_string(&self.read_bytes()?))
    }

    /// Read the remainder of the message as one text field.
    pub fn read_string_until_end(&mut self) -> Result<String> {
        Ok(decode_string(&self.read_bytes_until_end()?))
    }

    /// Reset the cursor and read the command token.
    ///
    /// Fails with end-of-input when the first field (and hence the whole
    /// message) is empty.
    pub fn read_command(&mut self) -> Result<String> {
        self.reset_read_pos();
        let command = self.read_string()?;
        if command.is_empty() {
            return Err(Error::EndOfInput);
        }
        Ok(command)
    }

    /// Move the read cursor back to the beginning.
    pub fn reset_read_pos(&mut self) {
        self.pos_read = 0;
    }

    /// Apply the transfer encoding and append the message terminator.
    ///
    /// The result goes onto the socket without further processing.
    pub fn encode_for_sending(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buf.len() + self.buf.len() / 8 + 1);
        for &b in &self.buf {
            match b {
                b'\\' => out.extend_from_slice(b"\\/"),
                0x0A => out.extend_from_slice(b"\\n"),
                _ => out.push(b),
            }
        }
        out.push(MESSAGE_TERMINATOR);
        out
    }

    /// Decoded length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written or received.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Trim surrounding whitespace and normalize CRLF and lone CR to LF.
fn trim_and_normalize(s: &str) -> String {
    s.trim().replace("\r\n", "\n").replace('\r', "\n")
}

fn decode_string(b: &[u8]) -> String {
    trim_and_normalize(&String::from_utf8_lossy(b))
}
