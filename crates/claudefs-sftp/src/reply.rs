//! Reply construction and the shared reply writer

use std::io::Write;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::attrs::FileAttrs;
use crate::codec::SftpEncoder;
use crate::dispatch::Call;
use crate::error::{Result, SftpError, SSH_FX_OK};
use crate::protocol::{
    SSH_FXP_ATTRS, SSH_FXP_DATA, SSH_FXP_HANDLE, SSH_FXP_NAME, SSH_FXP_STATUS,
};
use crate::wire::hexdump;

/// Language tag sent with every status message.
pub const STATUS_LANGUAGE: &str = "en";

/// Writes whole reply frames to the client.
///
/// One lock covers each frame so replies from concurrent workers never
/// interleave.
pub struct Responder {
    out: Mutex<Box<dyn Write + Send>>,
    debug: bool,
}

impl Responder {
    pub fn new<W: Write + Send + 'static>(out: W, debug: bool) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
            debug,
        }
    }

    /// Writes and flushes one complete frame.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        if self.debug {
            debug!("sending:\n{}", hexdump(frame));
        }
        let mut out = self.out.lock();
        out.write_all(frame)
            .and_then(|()| out.flush())
            .map_err(SftpError::Transport)
    }
}

/// One entry of a NAME reply.
#[derive(Debug, Clone)]
pub struct NameEntry {
    pub filename: String,
    /// `ls -l` line; only sent to v3 clients
    pub longname: String,
    pub attrs: FileAttrs,
}

impl Call<'_> {
    /// Starts a reply of type `op` for this request, built in the job arena.
    pub fn reply(&self, op: u8) -> SftpEncoder {
        self.reply_with_capacity(op, 128)
    }

    fn reply_with_capacity(&self, op: u8, capacity: usize) -> SftpEncoder {
        let mut enc = SftpEncoder::with_buffer(self.arena.buffer(capacity));
        enc.encode_u8(op);
        enc.encode_u32(self.id);
        enc
    }

    /// Finishes and sends a reply.
    pub fn send(&self, enc: SftpEncoder) -> Result<()> {
        let frame = enc.finish();
        trace!(id = self.id, len = frame.len(), "reply");
        self.session.responder().send(&frame)
    }

    /// Sends a status reply, downgrading codes the active version lacks.
    pub fn send_status(&self, code: u32, message: &str) -> Result<()> {
        let mut enc = self.reply(SSH_FXP_STATUS);
        enc.encode_u32(self.protocol.map_status(code));
        enc.encode_string(message);
        enc.encode_string(STATUS_LANGUAGE);
        self.send(enc)
    }

    pub fn send_ok(&self) -> Result<()> {
        self.send_status(SSH_FX_OK, "OK")
    }

    pub fn send_handle(&self, handle: &[u8]) -> Result<()> {
        let mut enc = self.reply(SSH_FXP_HANDLE);
        enc.encode_bytes(handle);
        self.send(enc)
    }

    pub fn send_data(&self, data: &[u8]) -> Result<()> {
        let mut enc = self.reply_with_capacity(SSH_FXP_DATA, data.len() + 16);
        enc.encode_bytes(data);
        self.send(enc)
    }

    pub fn send_attrs(&self, attrs: &FileAttrs) -> Result<()> {
        let mut enc = self.reply(SSH_FXP_ATTRS);
        attrs.encode(self.protocol.version, &mut enc);
        self.send(enc)
    }

    /// Sends a NAME reply. v4 dropped the longname field.
    pub fn send_names(&self, names: &[NameEntry]) -> Result<()> {
        let mut enc = self.reply_with_capacity(SSH_FXP_NAME, 64 + names.len() * 128);
        enc.encode_u32(names.len() as u32);
        for name in names {
            enc.encode_string(&name.filename);
            if self.protocol.version <= 3 {
                enc.encode_string(&name.longname);
            }
            name.attrs.encode(self.protocol.version, &mut enc);
        }
        self.send(enc)
    }
}
