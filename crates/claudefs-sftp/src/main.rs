#![warn(missing_docs)]

//! ClaudeFS SFTP server: serves one client over stdin/stdout

use anyhow::Result;
use claudefs_sftp::config::ServerConfig;
use claudefs_sftp::server::{configure_process, SftpServer};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let config = ServerConfig::load()?;

    // stdout carries protocol frames; diagnostics go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    tracing::info!("ClaudeFS SFTP server starting...");

    configure_process();
    let server = SftpServer::new(config, std::io::stdin().lock(), std::io::stdout())?;
    server.serve()?;
    Ok(())
}
