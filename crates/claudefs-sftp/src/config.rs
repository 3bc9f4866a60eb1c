//! Server configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SftpError};

/// Environment variable naming an optional JSON config file.
pub const CONFIG_ENV: &str = "CFS_SFTP_CONFIG";
/// Environment variable that, when set to anything, enables frame dumps.
pub const DEBUG_ENV: &str = "SFTPSERVER_DEBUGGING";

/// Largest WRITE payload a client sends plus framing headroom.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024 + 1024;

/// Smallest frame limit that still admits a handshake.
const MIN_FRAME_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Worker threads started after the handshake
    pub workers: usize,
    /// Jobs that may wait in the queue before the read loop blocks
    pub queue_depth: usize,
    /// Largest inbound frame accepted
    pub max_frame_len: usize,
    /// Hex-dump frames at debug level
    pub debug_frames: bool,
    /// Entries per READDIR reply
    pub readdir_batch: usize,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl ServerConfig {
    /// Reads the file named by `CFS_SFTP_CONFIG` if set, then applies
    /// `SFTPSERVER_DEBUGGING`.
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_ENV);
        let debugging = std::env::var_os(DEBUG_ENV).is_some();
        Self::from_sources(file.as_deref().map(Path::new), debugging)
    }

    pub fn from_sources(file: Option<&Path>, debugging: bool) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if debugging {
            config.debug_frames = true;
            config.log_level = "debug".to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SftpError::Config {
            reason: format!("reading {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&text).map_err(|e| SftpError::Config {
            reason: format!("parsing {}: {}", path.display(), e),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SftpError::Config {
                reason: "workers must be at least 1".to_string(),
            });
        }

        if self.queue_depth == 0 {
            return Err(SftpError::Config {
                reason: "queue_depth must be at least 1".to_string(),
            });
        }

        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(SftpError::Config {
                reason: format!("max_frame_len must be at least {}", MIN_FRAME_LEN),
            });
        }

        if self.readdir_batch == 0 {
            return Err(SftpError::Config {
                reason: "readdir_batch must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            debug_frames: false,
            readdir_batch: 64,
            log_level: "warn".to_string(),
        }
    }
}
