use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core_fs::VirtualFs;
use crate::session::ControlSession;

/// Runs the FTP server: accepts control connections and hands each one to a
/// session. Only one client is served at a time; a second connection
/// attempt while a session is live is refused at the listener.
pub async fn run(config: Arc<Config>, fs: Arc<dyn VirtualFs>) -> Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.server.listen_port))
        .await
        .with_context(|| format!("failed to bind control port {}", config.server.listen_port))?;
    info!("server listening on port {}", config.server.listen_port);

    let mut active: Option<JoinHandle<()>> = None;
    loop {
        let (socket, addr) = listener.accept().await?;
        if active.as_ref().is_some_and(|session| !session.is_finished()) {
            info!("connection from {addr} refused, only one client allowed");
            drop(socket);
            continue;
        }
        info!("connection accepted from {addr}");
        let session = ControlSession::new(socket, Arc::clone(&fs), &config.server);
        active = Some(tokio::spawn(session.run()));
    }
}
