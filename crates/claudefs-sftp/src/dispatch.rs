//! Request dispatch: one job in, exactly one reply out

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::arena::JobArena;
use crate::attrs::FileAttrs;
use crate::codec::SftpDecoder;
use crate::error::{Result, SSH_FX_BAD_MESSAGE, SSH_FX_FAILURE, SSH_FX_OP_UNSUPPORTED};
use crate::ordering::Ticket;
use crate::protocol::{Protocol, SSH_FXP_INIT};
use crate::session::Session;
use crate::worker::WorkerContext;

/// One inbound frame awaiting dispatch.
#[derive(Debug)]
pub struct Job {
    /// Frame payload, starting at the type byte
    pub payload: Bytes,
    /// Arrival sequence number
    pub serial: u64,
    /// Place in a handle queue, for serializable operations
    pub ticket: Option<Ticket>,
}

/// A request being handled.
pub struct Call<'a> {
    /// Request id echoed in the reply
    pub id: u32,
    pub op: u8,
    /// Arrival sequence number of the frame
    pub serial: u64,
    /// Remaining request arguments
    pub args: SftpDecoder,
    pub arena: &'a JobArena,
    pub worker: &'a mut WorkerContext,
    pub session: &'a Session,
    /// Table the request was dispatched through
    pub protocol: &'static Protocol,
}

impl Call<'_> {
    /// Reads a path argument and converts it to the local charset.
    pub fn path(&mut self) -> Result<PathBuf> {
        let raw = self.args.decode_bytes()?;
        self.worker.decode_path(&raw)
    }

    /// Reads a handle argument.
    pub fn handle(&mut self) -> Result<Bytes> {
        self.args.decode_bytes()
    }

    /// Reads an attribute block in the negotiated layout.
    pub fn attrs(&mut self) -> Result<FileAttrs> {
        FileAttrs::decode(self.protocol.version, &mut self.args)
    }
}

/// Runs one job to completion and sends its reply.
///
/// Client errors become status replies; only fatal errors are returned.
pub fn process_job(
    job: Job,
    session: &Session,
    worker: &mut WorkerContext,
    arena: &JobArena,
) -> Result<()> {
    let Job {
        payload,
        serial,
        ticket,
    } = job;
    // Held until the reply is sent; released on every exit path.
    let _turn = ticket.map(|t| session.tracker().wait_for_turn(t));

    let mut call = Call {
        id: 0,
        op: 0,
        serial,
        args: SftpDecoder::new(payload),
        arena,
        worker,
        session,
        protocol: session.protocol(),
    };

    call.op = match call.args.decode_u8() {
        Ok(op) => op,
        Err(_) => return call.send_status(SSH_FX_BAD_MESSAGE, "empty request"),
    };
    if call.op != SSH_FXP_INIT {
        call.id = match call.args.decode_u32() {
            Ok(id) => id,
            Err(_) => return call.send_status(SSH_FX_BAD_MESSAGE, "missing ID field"),
        };
    }

    let Some(command) = call.protocol.lookup(call.op).copied() else {
        debug!(op = call.op, id = call.id, "unsupported operation");
        return call.send_status(SSH_FX_OP_UNSUPPORTED, "operation not supported");
    };
    trace!(op = command.name, id = call.id, serial, "dispatch");

    match panic::catch_unwind(AssertUnwindSafe(|| (command.handler)(&mut call))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_fatal() => Err(e),
        Ok(Err(e)) => {
            debug!(op = command.name, id = call.id, error = %e, "request failed");
            call.send_status(e.status_code(), &e.to_string())
        }
        Err(_) => {
            error!(op = command.name, id = call.id, "handler panicked");
            call.send_status(SSH_FX_FAILURE, "internal error")
        }
    }
}
