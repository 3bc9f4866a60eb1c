//! SFTP server: the connection read loop and its worker pool

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::arena::JobArena;
use crate::codec::SftpDecoder;
use crate::config::ServerConfig;
use crate::dispatch::{process_job, Job};
use crate::error::{Result, SftpError};
use crate::ordering::{HandleKey, Ticket};
use crate::protocol::is_serializable;
use crate::queue::{WorkQueue, WorkerScope};
use crate::reply::Responder;
use crate::session::Session;
use crate::wire::{hexdump, read_frame};
use crate::worker::{Charset, WorkerContext};

/// Per-thread work performed by pool workers.
pub struct SftpWorkers {
    session: Arc<Session>,
    charset: Option<Charset>,
}

impl WorkerScope for SftpWorkers {
    type Job = Job;
    type State = WorkerContext;

    fn setup(&self) -> Result<WorkerContext> {
        match self.charset {
            Some(charset) => Ok(WorkerContext::with_charset(charset)),
            None => WorkerContext::new(),
        }
    }

    fn process(&self, worker: &mut WorkerContext, job: Job) {
        let arena = JobArena::new();
        if let Err(e) = process_job(job, &self.session, worker, &arena) {
            terminate(&e);
        }
    }
}

/// Logs a fatal error and exits. Replies may already be lost, so the
/// connection cannot continue.
pub fn terminate(e: &SftpError) -> ! {
    error!(error = %e, "fatal error, terminating");
    std::process::exit(1)
}

/// Process-wide setup done once before serving.
pub fn configure_process() {
    // SAFETY: both calls happen on the main thread before any other thread
    // exists; the locale argument is a NUL-terminated empty string.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::setlocale(libc::LC_CTYPE, b"\0".as_ptr() as *const libc::c_char);
    }
}

/// Extracts the handle of a serializable request without consuming it.
fn peek_handle(payload: &Bytes) -> Option<Bytes> {
    let mut dec = SftpDecoder::new(payload.clone());
    let op = dec.decode_u8().ok()?;
    if !is_serializable(op) {
        return None;
    }
    dec.decode_u32().ok()?;
    dec.decode_bytes().ok()
}

/// Serves one SFTP client over a byte stream pair.
pub struct SftpServer<R: Read> {
    input: R,
    session: Arc<Session>,
    scope: Arc<SftpWorkers>,
    inline: WorkerContext,
    pool: Option<WorkQueue<SftpWorkers>>,
    next_serial: u64,
}

impl<R: Read> SftpServer<R> {
    /// Creates a server converting filenames to the locale's charset.
    pub fn new<W: Write + Send + 'static>(config: ServerConfig, input: R, output: W) -> Result<Self> {
        Self::with_charset(config, input, output, None)
    }

    /// Creates a server with an explicit local filename charset.
    pub fn with_charset<W: Write + Send + 'static>(
        config: ServerConfig,
        input: R,
        output: W,
        charset: Option<Charset>,
    ) -> Result<Self> {
        config.validate()?;
        let responder = Responder::new(output, config.debug_frames);
        let session = Arc::new(Session::new(config, responder));
        let scope = Arc::new(SftpWorkers {
            session: Arc::clone(&session),
            charset,
        });
        let inline = scope.setup()?;
        Ok(Self {
            input,
            session,
            scope,
            inline,
            pool: None,
            next_serial: 0,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// True once the post-handshake worker pool exists.
    pub fn pool_running(&self) -> bool {
        self.pool.is_some()
    }

    fn register(&self, payload: &Bytes, serial: u64) -> Option<Ticket> {
        let handle = peek_handle(payload)?;
        Some(self.session.tracker().register(HandleKey::new(handle), serial))
    }

    fn start_pool(&mut self) -> Result<()> {
        let config = self.session.config();
        let pool = WorkQueue::start(Arc::clone(&self.scope), config.workers, config.queue_depth)?;
        self.pool = Some(pool);
        Ok(())
    }

    /// Reads and dispatches one frame. Returns `false` on a clean end of
    /// stream.
    pub fn step(&mut self) -> Result<bool> {
        let config = self.session.config();
        let Some(payload) = read_frame(&mut self.input, config.max_frame_len)? else {
            return Ok(false);
        };
        if config.debug_frames {
            debug!("received:\n{}", hexdump(&payload));
        }
        self.next_serial += 1;
        let serial = self.next_serial;
        let ticket = self.register(&payload, serial);
        let job = Job {
            payload,
            serial,
            ticket,
        };

        if let Some(pool) = &self.pool {
            pool.submit(job)?;
            return Ok(true);
        }
        let arena = JobArena::new();
        process_job(job, &self.session, &mut self.inline, &arena)?;
        // The VERSION reply is already out; only now may workers run.
        if self.session.is_initialized() {
            self.start_pool()?;
        }
        Ok(true)
    }

    /// Serves until the client closes the stream, then drains the pool.
    pub fn serve(mut self) -> Result<()> {
        info!("sftp session started");
        let outcome = loop {
            match self.step() {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if let Some(pool) = self.pool.take() {
            pool.destroy();
        }
        if outcome.is_ok() {
            info!("client closed the connection");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    use parking_lot::{const_mutex, Condvar, Mutex};

    use crate::codec::SftpEncoder;
    use crate::dispatch::Call;
    use crate::error::SSH_FX_OP_UNSUPPORTED;
    use crate::protocol::{
        Command, Protocol, SSH_FXP_OPEN, SSH_FXP_READ, SSH_FXP_STAT, SSH_FXP_WRITE, V3_ATTR_MASK,
    };

    static WRITES_RELEASED: Mutex<bool> = const_mutex(false);
    static WRITES_RELEASED_CV: Condvar = Condvar::new();

    fn held_write(call: &mut Call<'_>) -> Result<()> {
        let mut released = WRITES_RELEASED.lock();
        while !*released {
            WRITES_RELEASED_CV.wait(&mut released);
        }
        drop(released);
        call.send_ok()
    }

    fn quick_stat(call: &mut Call<'_>) -> Result<()> {
        call.send_ok()
    }

    fn release_writes() {
        *WRITES_RELEASED.lock() = true;
        WRITES_RELEASED_CV.notify_all();
    }

    static HELD_COMMANDS: [Command; 2] = [
        Command {
            op: SSH_FXP_WRITE,
            name: "write",
            handler: held_write,
        },
        Command {
            op: SSH_FXP_STAT,
            name: "stat",
            handler: quick_stat,
        },
    ];

    static HELD_WRITES: Protocol = Protocol {
        version: 3,
        max_status: SSH_FX_OP_UNSUPPORTED,
        attr_mask: V3_ATTR_MASK,
        preinit: false,
        commands: &HELD_COMMANDS,
    };

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        /// Request ids of the replies written so far, in write order.
        fn reply_ids(&self) -> Vec<u32> {
            let mut dec = SftpDecoder::new(Bytes::from(self.0.lock().clone()));
            let mut ids = Vec::new();
            while dec.remaining() > 0 {
                let mut frame = SftpDecoder::new(dec.decode_bytes().unwrap());
                frame.decode_u8().unwrap();
                ids.push(frame.decode_u32().unwrap());
            }
            ids
        }

        fn wait_for(&self, count: usize) -> Vec<u32> {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let ids = self.reply_ids();
                if ids.len() >= count || Instant::now() > deadline {
                    return ids;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn request(op: u8, id: u32, arg: &[u8]) -> Bytes {
        let mut enc = SftpEncoder::new();
        enc.encode_u8(op);
        enc.encode_u32(id);
        enc.encode_bytes(arg);
        enc.encode_u64(0);
        enc.finish()
    }

    fn payload(op: u8, handle: Option<&[u8]>) -> Bytes {
        let mut enc = SftpEncoder::new();
        enc.encode_u8(op);
        enc.encode_u32(7);
        if let Some(h) = handle {
            enc.encode_bytes(h);
            enc.encode_u64(0);
        }
        enc.finish().slice(4..)
    }

    #[test]
    fn test_peek_serializable_handle() {
        let p = payload(SSH_FXP_READ, Some(b"handle01"));
        assert_eq!(peek_handle(&p).as_deref(), Some(&b"handle01"[..]));
    }

    #[test]
    fn test_peek_ignores_other_ops() {
        let p = payload(SSH_FXP_OPEN, Some(b"/tmp/x"));
        assert!(peek_handle(&p).is_none());
    }

    #[test]
    fn test_peek_truncated() {
        assert!(peek_handle(&payload(SSH_FXP_READ, None)).is_none());
        assert!(peek_handle(&Bytes::new()).is_none());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = ServerConfig {
            workers: 0,
            ..Default::default()
        };
        let result = SftpServer::with_charset(
            config,
            std::io::empty(),
            std::io::sink(),
            Some(Charset::Utf8),
        );
        assert!(matches!(result, Err(SftpError::Config { .. })));
    }

    #[test]
    fn test_clean_eof_without_frames() {
        let mut server = SftpServer::with_charset(
            ServerConfig::default(),
            std::io::empty(),
            std::io::sink(),
            Some(Charset::Utf8),
        )
        .unwrap();
        assert!(!server.step().unwrap());
        assert!(!server.pool_running());
    }

    #[test]
    fn test_stat_not_held_behind_same_handle_writes() {
        let mut input = Vec::new();
        for id in 1..=3 {
            input.extend_from_slice(&request(SSH_FXP_WRITE, id, b"handle01"));
        }
        input.extend_from_slice(&request(SSH_FXP_STAT, 4, b"/tmp"));
        let output = Captured::default();
        let config = ServerConfig {
            workers: 4,
            ..Default::default()
        };
        let mut server = SftpServer::with_charset(
            config,
            Cursor::new(input),
            output.clone(),
            Some(Charset::Utf8),
        )
        .unwrap();
        assert!(server.session().install_protocol(&HELD_WRITES));
        server.start_pool().unwrap();
        for _ in 0..4 {
            assert!(server.step().unwrap());
        }

        let while_held = output.wait_for(1);
        let pending = server
            .session()
            .tracker()
            .pending(&HandleKey::new(Bytes::from_static(b"handle01")));
        release_writes();
        assert_eq!(while_held, vec![4]);
        assert_eq!(pending, 3);

        server.pool.take().unwrap().destroy();
        assert_eq!(output.reply_ids(), vec![4, 1, 2, 3]);
        assert_eq!(server.session().tracker().tracked_handles(), 0);
    }
}
