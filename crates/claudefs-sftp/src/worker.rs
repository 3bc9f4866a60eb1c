//! Per-worker-thread context: filename charset conversion and scratch space.

use std::ffi::{CStr, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use bytes::BytesMut;
use tracing::debug;

use crate::error::{Result, SftpError};

const SCRATCH_CAPACITY: usize = 4096;

/// Character sets a worker can convert filenames between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// UTF-8, the protocol charset
    Utf8,
    /// ISO-8859-1
    Latin1,
    /// 7-bit US-ASCII (the C/POSIX locale)
    Ascii,
}

impl Charset {
    /// Maps a `nl_langinfo(CODESET)` name onto a supported charset.
    pub fn from_codeset(name: &str) -> Result<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "utf8" => Ok(Charset::Utf8),
            "iso88591" | "latin1" | "l1" => Ok(Charset::Latin1),
            "ansix341968" | "ascii" | "usascii" | "646" => Ok(Charset::Ascii),
            _ => Err(SftpError::Setup {
                reason: format!("no conversion available between UTF-8 and {}", name),
            }),
        }
    }

    /// Charset of the current `LC_CTYPE` locale.
    pub fn local() -> Result<Self> {
        // SAFETY: nl_langinfo returns a pointer to a static NUL-terminated
        // string owned by libc, valid until the next setlocale call.
        let codeset = unsafe {
            let ptr = libc::nl_langinfo(libc::CODESET);
            if ptr.is_null() {
                return Err(SftpError::Setup {
                    reason: "nl_langinfo(CODESET) returned NULL".to_string(),
                });
            }
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        };
        Self::from_codeset(&codeset)
    }
}

/// One-directional conversion handle.
#[derive(Debug, Clone, Copy)]
pub struct Converter {
    from: Charset,
    to: Charset,
}

impl Converter {
    /// Opens a converter from `from` to `to`.
    pub fn open(to: Charset, from: Charset) -> Self {
        Self { from, to }
    }

    /// Appends the conversion of `input` to `out`.
    pub fn convert(&self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        let text: std::borrow::Cow<'_, str> = match self.from {
            Charset::Utf8 => std::str::from_utf8(input)
                .map_err(|e| SftpError::Charset {
                    reason: format!("invalid UTF-8: {}", e),
                })?
                .into(),
            Charset::Latin1 => input.iter().map(|b| *b as char).collect::<String>().into(),
            Charset::Ascii => {
                if let Some(b) = input.iter().find(|b| !b.is_ascii()) {
                    return Err(SftpError::Charset {
                        reason: format!("byte {:#04x} is not ASCII", b),
                    });
                }
                // ASCII is a subset of UTF-8.
                std::str::from_utf8(input)
                    .map_err(|e| SftpError::Charset {
                        reason: e.to_string(),
                    })?
                    .into()
            }
        };
        match self.to {
            Charset::Utf8 => out.extend_from_slice(text.as_bytes()),
            Charset::Latin1 | Charset::Ascii => {
                let limit = if self.to == Charset::Latin1 { 0xFF } else { 0x7F };
                for c in text.chars() {
                    let code = c as u32;
                    if code > limit {
                        return Err(SftpError::Charset {
                            reason: format!("{:?} cannot represent {:?}", self.to, c),
                        });
                    }
                    out.extend_from_slice(&[code as u8]);
                }
            }
        }
        Ok(())
    }
}

/// State owned by exactly one worker thread for its whole lifetime.
pub struct WorkerContext {
    utf8_to_local: Converter,
    local_to_utf8: Converter,
    scratch: BytesMut,
}

impl WorkerContext {
    /// Creates a context converting to and from the locale's charset.
    pub fn new() -> Result<Self> {
        Ok(Self::with_charset(Charset::local()?))
    }

    /// Creates a context for an explicit local charset.
    pub fn with_charset(local: Charset) -> Self {
        debug!(charset = ?local, "worker context created");
        Self {
            utf8_to_local: Converter::open(local, Charset::Utf8),
            local_to_utf8: Converter::open(Charset::Utf8, local),
            scratch: BytesMut::with_capacity(SCRATCH_CAPACITY),
        }
    }

    /// Converts a UTF-8 path from the wire into a local path.
    pub fn decode_path(&mut self, wire: &[u8]) -> Result<PathBuf> {
        self.scratch.clear();
        self.utf8_to_local.convert(wire, &mut self.scratch)?;
        Ok(PathBuf::from(OsString::from_vec(self.scratch.to_vec())))
    }

    /// Converts a local filename into UTF-8 for the wire.
    pub fn encode_name(&mut self, local: &OsStr) -> Result<String> {
        self.scratch.clear();
        self.local_to_utf8.convert(local.as_bytes(), &mut self.scratch)?;
        String::from_utf8(self.scratch.to_vec()).map_err(|e| SftpError::Charset {
            reason: e.to_string(),
        })
    }

    /// Reusable scratch buffer, cleared by each conversion.
    pub fn scratch(&mut self) -> &mut BytesMut {
        &mut self.scratch
    }
}
