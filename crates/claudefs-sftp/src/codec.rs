//! SFTP wire encoding/decoding (draft-ietf-secsh-filexfer-02 / -04)
//!
//! All integers are big-endian. Strings are a `u32` length followed by that
//! many bytes, with no padding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, SftpError};

/// Builder for one outbound SFTP frame.
///
/// The 4-byte length prefix is reserved up front and patched by
/// [`SftpEncoder::finish`].
pub struct SftpEncoder {
    buf: BytesMut,
}

impl SftpEncoder {
    /// Creates an encoder with a fresh buffer.
    pub fn new() -> Self {
        Self::with_buffer(BytesMut::new())
    }

    /// Creates an encoder that writes into `buf`, typically carved from a
    /// job arena.
    pub fn with_buffer(mut buf: BytesMut) -> Self {
        buf.clear();
        buf.put_u32(0);
        Self { buf }
    }

    /// Encodes a single byte.
    pub fn encode_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Encodes a 32-bit unsigned integer.
    pub fn encode_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Encodes a 64-bit unsigned integer.
    pub fn encode_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    /// Encodes a byte string (length prefix + data).
    pub fn encode_bytes(&mut self, data: &[u8]) {
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    /// Encodes a UTF-8 string.
    pub fn encode_string(&mut self, s: &str) {
        self.encode_bytes(s.as_bytes());
    }

    /// Payload bytes written so far, excluding the length prefix.
    pub fn payload_len(&self) -> usize {
        self.buf.len() - 4
    }

    /// Patches the length prefix and returns the complete frame.
    pub fn finish(mut self) -> Bytes {
        let len = self.payload_len() as u32;
        self.buf[..4].copy_from_slice(&len.to_be_bytes());
        self.buf.freeze()
    }
}

impl Default for SftpEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked read cursor over one request payload.
///
/// Every read either succeeds in full or fails with
/// [`SftpError::Underrun`] leaving the cursor where it was.
#[derive(Debug, Clone)]
pub struct SftpDecoder {
    buf: Bytes,
    pos: usize,
}

impl SftpDecoder {
    /// Creates a decoder positioned at the start of `buf`.
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn ensure_available(&self, len: usize) -> Result<()> {
        let available = self.remaining();
        if len > available {
            return Err(SftpError::Underrun {
                needed: len,
                available,
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<Bytes> {
        self.ensure_available(len)?;
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    /// Decodes a single byte.
    pub fn decode_u8(&mut self) -> Result<u8> {
        self.ensure_available(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Decodes a 32-bit unsigned integer.
    pub fn decode_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Decodes a 64-bit unsigned integer.
    pub fn decode_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Decodes a length-prefixed byte string without copying.
    pub fn decode_bytes(&mut self) -> Result<Bytes> {
        let start = self.pos;
        let len = self.decode_u32()? as usize;
        match self.take(len) {
            Ok(data) => Ok(data),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Decodes a length-prefixed string that must be valid UTF-8.
    pub fn decode_string(&mut self) -> Result<String> {
        let data = self.decode_bytes()?;
        String::from_utf8(data.to_vec()).map_err(|e| SftpError::BadMessage {
            reason: format!("invalid UTF-8: {}", e),
        })
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Total payload length, regardless of cursor position.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
