//! Length-prefixed frame reading and frame dumps

use std::fmt::Write as _;
use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use crate::error::{Result, SftpError};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Reads into `buf` until it is full or the stream ends; returns bytes read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(SftpError::Transport(e)),
        }
    }
    Ok(got)
}

/// Reads one frame payload.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames. A stream
/// ending anywhere inside a frame, prefix included, is a [`SftpError::TruncatedFrame`].
pub fn read_frame(reader: &mut impl Read, max_len: usize) -> Result<Option<Bytes>> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    match fill(reader, &mut prefix)? {
        0 => return Ok(None),
        LENGTH_PREFIX => {}
        got => {
            return Err(SftpError::TruncatedFrame {
                expected: LENGTH_PREFIX,
                got,
            })
        }
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(SftpError::FrameTooLarge {
            len,
            limit: max_len,
        });
    }

    let mut payload = BytesMut::zeroed(len);
    let got = fill(reader, &mut payload)?;
    if got != len {
        return Err(SftpError::TruncatedFrame { expected: len, got });
    }
    Ok(Some(payload.freeze()))
}

/// Offset, hex and ASCII columns, 16 bytes per line.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 16);
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {:02x}", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}
