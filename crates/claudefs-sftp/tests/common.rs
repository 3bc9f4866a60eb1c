//! Common test utilities: an in-process client speaking to a server thread
//! over in-memory pipes.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use claudefs_sftp::codec::{SftpDecoder, SftpEncoder};
use claudefs_sftp::protocol::{
    SSH_FXP_HANDLE, SSH_FXP_INIT, SSH_FXP_NAME, SSH_FXP_STATUS, SSH_FXP_VERSION,
};
use claudefs_sftp::worker::Charset;
use claudefs_sftp::{ServerConfig, SftpServer};
use parking_lot::{Condvar, Mutex};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

/// Unbounded in-memory byte pipe. Reads block until data arrives or the
/// pipe is closed.
#[derive(Clone, Default)]
pub struct Pipe {
    inner: Arc<(Mutex<PipeState>, Condvar)>,
}

impl Pipe {
    pub fn close(&self) {
        let (state, cond) = &*self.inner;
        state.lock().closed = true;
        cond.notify_all();
    }

    /// Waits for one complete frame and returns its payload.
    pub fn next_frame(&self) -> Option<Vec<u8>> {
        let (state, cond) = &*self.inner;
        let mut state = state.lock();
        loop {
            if state.data.len() >= 4 {
                let prefix: Vec<u8> = state.data.iter().take(4).copied().collect();
                let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
                if state.data.len() >= 4 + len {
                    state.data.drain(..4);
                    return Some(state.data.drain(..len).collect());
                }
            }
            if state.closed {
                return None;
            }
            if cond.wait_for(&mut state, REPLY_TIMEOUT).timed_out() {
                return None;
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.inner.0.lock().data.len()
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (state, cond) = &*self.inner;
        let mut state = state.lock();
        while state.data.is_empty() && !state.closed {
            cond.wait(&mut state);
        }
        let n = buf.len().min(state.data.len());
        for (slot, byte) in buf.iter_mut().zip(state.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (state, cond) = &*self.inner;
        state.lock().data.extend(buf.iter().copied());
        cond.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A decoded reply frame.
pub struct Reply {
    pub op: u8,
    /// Request id; absent on VERSION
    pub id: Option<u32>,
    pub body: SftpDecoder,
}

impl Reply {
    fn parse(payload: Vec<u8>) -> Self {
        let mut body = SftpDecoder::new(Bytes::from(payload));
        let op = body.decode_u8().expect("reply type");
        let id = if op == SSH_FXP_VERSION {
            None
        } else {
            Some(body.decode_u32().expect("reply id"))
        };
        Self { op, id, body }
    }

    /// (code, message) of a STATUS reply.
    pub fn status(mut self) -> (u32, String) {
        assert_eq!(self.op, SSH_FXP_STATUS, "expected STATUS reply");
        let code = self.body.decode_u32().unwrap();
        let message = self.body.decode_string().unwrap();
        let language = self.body.decode_string().unwrap();
        assert_eq!(language, "en");
        (code, message)
    }

    pub fn status_code(self) -> u32 {
        self.status().0
    }

    pub fn handle(mut self) -> Bytes {
        assert_eq!(self.op, SSH_FXP_HANDLE, "expected HANDLE reply");
        self.body.decode_bytes().unwrap()
    }

    /// Filenames of a NAME reply.
    pub fn names(mut self, version: u32) -> Vec<String> {
        assert_eq!(self.op, SSH_FXP_NAME, "expected NAME reply");
        let count = self.body.decode_u32().unwrap();
        let mut names = Vec::new();
        for _ in 0..count {
            names.push(self.body.decode_string().unwrap());
            if version == 3 {
                self.body.decode_string().unwrap();
            }
            claudefs_sftp::attrs::FileAttrs::decode(version, &mut self.body).unwrap();
        }
        names
    }
}

/// Client end of a server running on its own thread.
pub struct Client {
    to_server: Pipe,
    from_server: Pipe,
    server: Option<JoinHandle<claudefs_sftp::Result<()>>>,
    next_id: u32,
    pub version: u32,
}

impl Client {
    pub fn start() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let to_server = Pipe::default();
        let from_server = Pipe::default();
        let input = to_server.clone();
        let output = from_server.clone();
        let server = thread::spawn(move || {
            SftpServer::with_charset(config, input, output, Some(Charset::Utf8))?.serve()
        });
        Self {
            to_server,
            from_server,
            server: Some(server),
            next_id: 1,
            version: 3,
        }
    }

    /// Starts a server and completes the handshake at `version`.
    pub fn connected(version: u32) -> Self {
        let mut client = Self::start();
        let mut reply = client.init(version);
        assert_eq!(reply.op, SSH_FXP_VERSION);
        client.version = reply.body.decode_u32().unwrap();
        client
    }

    pub fn send_bytes(&self, bytes: &[u8]) {
        self.to_server.clone().write_all(bytes).unwrap();
    }

    pub fn send_raw(&self, payload: &[u8]) {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        self.send_bytes(&frame);
    }

    /// Sends a request and returns its id without waiting for the reply.
    pub fn send(&mut self, op: u8, build: impl FnOnce(&mut SftpEncoder)) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        let mut enc = SftpEncoder::new();
        enc.encode_u8(op);
        enc.encode_u32(id);
        build(&mut enc);
        self.send_bytes(&enc.finish());
        id
    }

    pub fn recv(&self) -> Reply {
        let payload = self.from_server.next_frame().expect("no reply from server");
        Reply::parse(payload)
    }

    /// Sends a request and waits for its reply.
    pub fn call(&mut self, op: u8, build: impl FnOnce(&mut SftpEncoder)) -> Reply {
        let id = self.send(op, build);
        let reply = self.recv();
        assert_eq!(reply.id, Some(id), "reply to a different request");
        reply
    }

    pub fn init(&mut self, version: u32) -> Reply {
        let mut enc = SftpEncoder::new();
        enc.encode_u8(SSH_FXP_INIT);
        enc.encode_u32(version);
        self.send_bytes(&enc.finish());
        self.recv()
    }

    /// True when no reply is waiting.
    pub fn idle(&self) -> bool {
        self.from_server.buffered() == 0
    }

    /// Closes the client's stream and returns how the server finished.
    pub fn finish(mut self) -> claudefs_sftp::Result<()> {
        self.to_server.close();
        let server = self.server.take().expect("server already joined");
        server.join().expect("server thread panicked")
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.to_server.close();
    }
}

/// Encodes a path argument.
pub fn path_arg(enc: &mut SftpEncoder, path: &std::path::Path) {
    enc.encode_string(path.to_str().expect("utf-8 test path"));
}
