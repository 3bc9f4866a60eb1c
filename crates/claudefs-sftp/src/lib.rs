#![warn(missing_docs)]

//! ClaudeFS SFTP subsystem: SFTP v3/v4 file-transfer server over stdio

pub mod arena;
pub mod attrs;
pub mod codec;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handles;
pub mod handshake;
pub mod ordering;
pub mod protocol;
pub mod queue;
pub mod reply;
pub mod server;
pub mod session;
pub mod wire;
pub mod worker;

pub use config::ServerConfig;
pub use error::{Result, SftpError};
pub use server::SftpServer;
