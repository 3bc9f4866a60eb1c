//! Error types for the ClaudeFS SFTP server

use std::io;

use thiserror::Error;

/// SFTP status: OK (success)
pub const SSH_FX_OK: u32 = 0;
/// SFTP status: end of file
pub const SSH_FX_EOF: u32 = 1;
/// SFTP status: no such file
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
/// SFTP status: permission denied
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
/// SFTP status: generic failure
pub const SSH_FX_FAILURE: u32 = 4;
/// SFTP status: malformed message
pub const SSH_FX_BAD_MESSAGE: u32 = 5;
/// SFTP status: no connection
pub const SSH_FX_NO_CONNECTION: u32 = 6;
/// SFTP status: connection lost
pub const SSH_FX_CONNECTION_LOST: u32 = 7;
/// SFTP status: operation unsupported
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;
/// SFTP status (v4+): invalid handle
pub const SSH_FX_INVALID_HANDLE: u32 = 9;
/// SFTP status (v4+): no such path
pub const SSH_FX_NO_SUCH_PATH: u32 = 10;
/// SFTP status (v4+): file already exists
pub const SSH_FX_FILE_ALREADY_EXISTS: u32 = 11;
/// SFTP status (v4+): write protected
pub const SSH_FX_WRITE_PROTECT: u32 = 12;
/// SFTP status (v4+): no media
pub const SSH_FX_NO_MEDIA: u32 = 13;

/// Errors raised while framing, dispatching or executing SFTP requests.
#[derive(Error, Debug)]
pub enum SftpError {
    /// A parse ran past the end of the request payload
    #[error("payload underrun: needed {needed} bytes, {available} available")]
    Underrun {
        /// Bytes the parse needed
        needed: usize,
        /// Bytes left in the payload
        available: usize,
    },
    /// Syntactically invalid request
    #[error("malformed request: {reason}")]
    BadMessage {
        /// What was wrong with the request
        reason: String,
    },
    /// Request uses a feature this server does not implement
    #[error("operation not supported: {reason}")]
    Unsupported {
        /// The unsupported feature
        reason: String,
    },
    /// Handle string does not name an open file or directory
    #[error("invalid handle")]
    InvalidHandle,
    /// Read or readdir past the end
    #[error("end of file")]
    Eof,
    /// Filename could not be converted between UTF-8 and the local charset
    #[error("charset conversion failed: {reason}")]
    Charset {
        /// The conversion failure
        reason: String,
    },
    /// Inbound stream ended inside a frame
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    TruncatedFrame {
        /// Bytes the frame header promised
        expected: usize,
        /// Bytes actually received
        got: usize,
    },
    /// Declared frame length exceeds the configured limit
    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Declared frame length
        len: usize,
        /// Configured maximum
        limit: usize,
    },
    /// Reading requests or writing replies failed
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    /// Worker or process setup failed
    #[error("setup error: {reason}")]
    Setup {
        /// The setup failure
        reason: String,
    },
    /// Invalid server configuration
    #[error("configuration error: {reason}")]
    Config {
        /// The configuration problem
        reason: String,
    },
    /// Filesystem error from a command handler
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl SftpError {
    /// Converts the error to the SFTP status code sent back to the client.
    ///
    /// The result may exceed what the negotiated protocol version
    /// understands; see [`crate::protocol::Protocol::map_status`].
    pub fn status_code(&self) -> u32 {
        match self {
            SftpError::Underrun { .. } => SSH_FX_BAD_MESSAGE,
            SftpError::BadMessage { .. } => SSH_FX_BAD_MESSAGE,
            SftpError::Unsupported { .. } => SSH_FX_OP_UNSUPPORTED,
            SftpError::InvalidHandle => SSH_FX_INVALID_HANDLE,
            SftpError::Eof => SSH_FX_EOF,
            SftpError::Charset { .. } => SSH_FX_FAILURE,
            SftpError::Io(e) => io_status(e),
            SftpError::TruncatedFrame { .. }
            | SftpError::FrameTooLarge { .. }
            | SftpError::Transport(_)
            | SftpError::Setup { .. }
            | SftpError::Config { .. } => SSH_FX_FAILURE,
        }
    }

    /// True for errors that end the connection instead of producing a
    /// status reply.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SftpError::TruncatedFrame { .. }
                | SftpError::FrameTooLarge { .. }
                | SftpError::Transport(_)
                | SftpError::Setup { .. }
                | SftpError::Config { .. }
        )
    }
}

fn io_status(e: &io::Error) -> u32 {
    match e.kind() {
        io::ErrorKind::NotFound => return SSH_FX_NO_SUCH_FILE,
        io::ErrorKind::PermissionDenied => return SSH_FX_PERMISSION_DENIED,
        io::ErrorKind::AlreadyExists => return SSH_FX_FILE_ALREADY_EXISTS,
        _ => {}
    }
    match e.raw_os_error() {
        Some(libc::EROFS) => SSH_FX_WRITE_PROTECT,
        Some(libc::ENOMEDIUM) => SSH_FX_NO_MEDIA,
        Some(libc::EPERM) => SSH_FX_PERMISSION_DENIED,
        Some(libc::ENOTDIR) => SSH_FX_NO_SUCH_PATH,
        _ => SSH_FX_FAILURE,
    }
}

/// Result type alias using SftpError as the error type.
pub type Result<T> = std::result::Result<T, SftpError>;
