//! Per-connection state shared by the read loop and all workers

use std::sync::OnceLock;

use tracing::info;

use crate::config::ServerConfig;
use crate::handles::HandleTable;
use crate::ordering::OrderingTracker;
use crate::protocol::{Protocol, SFTP_PREINIT};
use crate::reply::Responder;

/// State for the single connection a server process serves.
pub struct Session {
    protocol: OnceLock<&'static Protocol>,
    tracker: OrderingTracker,
    handles: HandleTable,
    responder: Responder,
    config: ServerConfig,
}

impl Session {
    /// Creates a session in the uninitialized (pre-handshake) state.
    pub fn new(config: ServerConfig, responder: Responder) -> Self {
        Self {
            protocol: OnceLock::new(),
            tracker: OrderingTracker::new(),
            handles: HandleTable::new(),
            responder,
            config,
        }
    }

    /// The active protocol table: pre-init until a handshake succeeds.
    pub fn protocol(&self) -> &'static Protocol {
        self.protocol.get().copied().unwrap_or(&SFTP_PREINIT)
    }

    /// True once a versioned table has been installed.
    pub fn is_initialized(&self) -> bool {
        self.protocol.get().is_some()
    }

    /// Installs the negotiated table. Succeeds at most once per session.
    pub fn install_protocol(&self, protocol: &'static Protocol) -> bool {
        let installed = self.protocol.set(protocol).is_ok();
        if installed {
            info!(version = protocol.version, "protocol negotiated");
        }
        installed
    }

    /// Ordering tracker for handle-affecting operations.
    pub fn tracker(&self) -> &OrderingTracker {
        &self.tracker
    }

    /// Open file and directory handles.
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Reply sink.
    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
