//! SSH_FXP_INIT version negotiation

use tracing::{info, warn};

use crate::codec::SftpEncoder;
use crate::dispatch::Call;
use crate::error::{Result, SSH_FX_BAD_MESSAGE, SSH_FX_FAILURE, SSH_FX_OP_UNSUPPORTED};
use crate::protocol::{self, MAX_VERSION, MIN_VERSION, SSH_FXP_VERSION};

/// Versions advertised in the "versions" extension.
pub const SUPPORTED_VERSIONS: &str = "3,4";

/// Picks the version to speak with a client offering `requested`.
///
/// Versions below the minimum are refused; anything above the maximum is
/// downgraded to it.
pub fn negotiate_version(requested: u32) -> Option<u32> {
    if requested < MIN_VERSION {
        None
    } else {
        Some(requested.min(MAX_VERSION))
    }
}

/// Handles SSH_FXP_INIT.
///
/// On success the negotiated table is installed and the VERSION reply sent;
/// the caller starts the worker pool afterwards.
pub fn sftp_init(call: &mut Call<'_>) -> Result<()> {
    if !call.protocol.preinit || call.session.is_initialized() {
        warn!("repeated SSH_FXP_INIT");
        return call.send_status(SSH_FX_FAILURE, "already initialized");
    }
    let Ok(requested) = call.args.decode_u32() else {
        return call.send_status(SSH_FX_BAD_MESSAGE, "no version found in SSH_FXP_INIT");
    };
    let Some(version) = negotiate_version(requested) else {
        info!(requested, "client protocol version too old");
        return call.send_status(
            SSH_FX_OP_UNSUPPORTED,
            "client protocol version is too old (need at least 3)",
        );
    };
    let Some(table) = protocol::for_version(version) else {
        return call.send_status(SSH_FX_FAILURE, "no table for negotiated version");
    };
    if !call.session.install_protocol(table) {
        return call.send_status(SSH_FX_FAILURE, "already initialized");
    }
    info!(requested, version, "client initialized");

    let mut enc = SftpEncoder::with_buffer(call.arena.buffer(64));
    enc.encode_u8(SSH_FXP_VERSION);
    enc.encode_u32(version);
    enc.encode_string("newline");
    enc.encode_string("\n");
    enc.encode_string("versions");
    enc.encode_string(SUPPORTED_VERSIONS);
    call.send(enc)
}
