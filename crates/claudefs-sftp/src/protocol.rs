//! SFTP message types and per-version dispatch tables

use crate::commands;
use crate::dispatch::Call;
use crate::error::{Result, SSH_FX_FAILURE, SSH_FX_NO_MEDIA, SSH_FX_OP_UNSUPPORTED};
use crate::handshake;

pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSTAT: u8 = 8;
pub const SSH_FXP_SETSTAT: u8 = 9;
pub const SSH_FXP_FSETSTAT: u8 = 10;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_READLINK: u8 = 19;
pub const SSH_FXP_SYMLINK: u8 = 20;

pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;

/// Lowest protocol version the server speaks
pub const MIN_VERSION: u32 = 3;
/// Highest protocol version the server speaks
pub const MAX_VERSION: u32 = 4;

/// Handler entry point for one operation.
pub type Handler = fn(&mut Call<'_>) -> Result<()>;

/// One row of a dispatch table.
#[derive(Clone, Copy)]
pub struct Command {
    /// Operation code
    pub op: u8,
    /// Name used in logs
    pub name: &'static str,
    /// Handler invoked for the operation
    pub handler: Handler,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("op", &self.op)
            .field("name", &self.name)
            .finish()
    }
}

/// Finds the command for `op` in a table sorted ascending by op code.
pub fn lookup_command(commands: &[Command], op: u8) -> Option<&Command> {
    commands
        .binary_search_by_key(&op, |c| c.op)
        .ok()
        .map(|i| &commands[i])
}

/// An immutable protocol description: dispatch table plus version metadata.
#[derive(Debug)]
pub struct Protocol {
    /// Negotiated version (3 for the pre-init table, which never reports it)
    pub version: u32,
    /// Highest status code the version defines
    pub max_status: u32,
    /// Attribute flags this version understands
    pub attr_mask: u32,
    /// Whether this is the handshake-only table
    pub preinit: bool,
    pub(crate) commands: &'static [Command],
}

impl Protocol {
    /// Looks up the handler for `op`.
    pub fn lookup(&self, op: u8) -> Option<&Command> {
        lookup_command(self.commands, op)
    }

    /// The dispatch table, sorted by op code.
    pub fn commands(&self) -> &'static [Command] {
        self.commands
    }

    /// Maps a status code onto one this version understands.
    pub fn map_status(&self, code: u32) -> u32 {
        if code > self.max_status {
            SSH_FX_FAILURE
        } else {
            code
        }
    }
}

/// v3 attribute flags: size, uid/gid, permissions, atime/mtime, extended
pub const V3_ATTR_MASK: u32 = 0x8000_000F;
/// v4 attribute flags: size, permissions, access/modify times, owner/group, extended
pub const V4_ATTR_MASK: u32 = 0x8000_00AD;

static PREINIT_COMMANDS: [Command; 1] = [Command {
    op: SSH_FXP_INIT,
    name: "init",
    handler: handshake::sftp_init,
}];

macro_rules! file_commands {
    () => {
        [
            Command { op: SSH_FXP_INIT, name: "init", handler: handshake::sftp_init },
            Command { op: SSH_FXP_OPEN, name: "open", handler: commands::sftp_open },
            Command { op: SSH_FXP_CLOSE, name: "close", handler: commands::sftp_close },
            Command { op: SSH_FXP_READ, name: "read", handler: commands::sftp_read },
            Command { op: SSH_FXP_WRITE, name: "write", handler: commands::sftp_write },
            Command { op: SSH_FXP_LSTAT, name: "lstat", handler: commands::sftp_lstat },
            Command { op: SSH_FXP_FSTAT, name: "fstat", handler: commands::sftp_fstat },
            Command { op: SSH_FXP_SETSTAT, name: "setstat", handler: commands::sftp_setstat },
            Command { op: SSH_FXP_FSETSTAT, name: "fsetstat", handler: commands::sftp_fsetstat },
            Command { op: SSH_FXP_OPENDIR, name: "opendir", handler: commands::sftp_opendir },
            Command { op: SSH_FXP_READDIR, name: "readdir", handler: commands::sftp_readdir },
            Command { op: SSH_FXP_REMOVE, name: "remove", handler: commands::sftp_remove },
            Command { op: SSH_FXP_MKDIR, name: "mkdir", handler: commands::sftp_mkdir },
            Command { op: SSH_FXP_RMDIR, name: "rmdir", handler: commands::sftp_rmdir },
            Command { op: SSH_FXP_REALPATH, name: "realpath", handler: commands::sftp_realpath },
            Command { op: SSH_FXP_STAT, name: "stat", handler: commands::sftp_stat },
            Command { op: SSH_FXP_RENAME, name: "rename", handler: commands::sftp_rename },
            Command { op: SSH_FXP_READLINK, name: "readlink", handler: commands::sftp_readlink },
            Command { op: SSH_FXP_SYMLINK, name: "symlink", handler: commands::sftp_symlink },
        ]
    };
}

static V3_COMMANDS: [Command; 19] = file_commands!();
static V4_COMMANDS: [Command; 19] = file_commands!();

/// Handshake-only table active until SSH_FXP_INIT succeeds.
pub static SFTP_PREINIT: Protocol = Protocol {
    version: 3,
    max_status: SSH_FX_OP_UNSUPPORTED,
    attr_mask: u32::MAX,
    preinit: true,
    commands: &PREINIT_COMMANDS,
};

/// SFTP version 3 (draft-ietf-secsh-filexfer-02)
pub static SFTP_V3: Protocol = Protocol {
    version: 3,
    max_status: SSH_FX_OP_UNSUPPORTED,
    attr_mask: V3_ATTR_MASK,
    preinit: false,
    commands: &V3_COMMANDS,
};

/// SFTP version 4 (draft-ietf-secsh-filexfer-04)
pub static SFTP_V4: Protocol = Protocol {
    version: 4,
    max_status: SSH_FX_NO_MEDIA,
    attr_mask: V4_ATTR_MASK,
    preinit: false,
    commands: &V4_COMMANDS,
};

/// Returns the table for a negotiated version.
pub fn for_version(version: u32) -> Option<&'static Protocol> {
    match version {
        3 => Some(&SFTP_V3),
        4 => Some(&SFTP_V4),
        _ => None,
    }
}

/// Operations that must complete in arrival order per handle.
pub fn is_serializable(op: u8) -> bool {
    matches!(
        op,
        SSH_FXP_READ | SSH_FXP_WRITE | SSH_FXP_FSETSTAT | SSH_FXP_FSTAT
    )
}
