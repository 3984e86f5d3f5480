//! Passive-mode data worker. One worker is spawned per PASV command; it owns
//! one listening socket, accepts one peer connection and executes exactly one
//! of LIST/RETR/STOR before being told to close. It is never reused.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::constants::{DATA_BIND_ATTEMPTS, TRANSFER_CHUNK_SIZE};
use crate::core_fs::VirtualFs;
use crate::core_ipc::{
    rendezvous_channel, ChannelClosed, DataCommand, DataReply, RendezvousReceiver, RendezvousSender,
};
use crate::core_path::{self, VirtualPath};

#[derive(Debug, Error)]
pub enum DataOpenError {
    #[error("no free data port")]
    NoFreePort,
    #[error(transparent)]
    Channel(#[from] ChannelClosed),
}

/// Control-side handle for a running data worker.
pub struct DataChannel {
    commands: RendezvousSender<DataCommand>,
    replies: RendezvousReceiver<DataReply>,
    worker: JoinHandle<()>,
    port: u16,
}

impl DataChannel {
    /// Spawns a data worker and waits for it to report its listening port.
    pub async fn open(fs: Arc<dyn VirtualFs>, first_port: u16) -> Result<Self, DataOpenError> {
        let (command_tx, command_rx) = rendezvous_channel();
        let (reply_tx, mut reply_rx) = rendezvous_channel();

        let worker = tokio::spawn(async move {
            DataSession::new(fs, command_rx, reply_tx).run(first_port).await;
        });

        match reply_rx.recv().await? {
            DataReply::Port(Some(port)) => {
                debug!("data worker listening on port {port}");
                Ok(Self {
                    commands: command_tx,
                    replies: reply_rx,
                    worker,
                    port,
                })
            }
            DataReply::Port(None) => {
                let _ = worker.await;
                Err(DataOpenError::NoFreePort)
            }
            DataReply::Reply(_) => Err(ChannelClosed.into()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn send(&self, command: DataCommand) -> Result<(), ChannelClosed> {
        self.commands.send(command).await
    }

    /// Receives one reply line to relay to the client.
    pub async fn recv_reply(&mut self) -> Result<String, ChannelClosed> {
        match self.replies.recv().await? {
            DataReply::Reply(line) => Ok(line),
            // The port is announced exactly once, before the handle exists.
            DataReply::Port(_) => Err(ChannelClosed),
        }
    }

    /// Orders the worker to stop and waits for it to terminate.
    pub async fn close(self) {
        let _ = self.commands.send(DataCommand::Close).await;
        debug!("waiting for data connection to close");
        if let Err(e) = self.worker.await {
            error!("data worker task failed: {e}");
        }
        debug!("finished waiting for data worker");
    }
}

struct DataSession {
    fs: Arc<dyn VirtualFs>,
    commands: RendezvousReceiver<DataCommand>,
    replies: RendezvousSender<DataReply>,
}

impl DataSession {
    fn new(
        fs: Arc<dyn VirtualFs>,
        commands: RendezvousReceiver<DataCommand>,
        replies: RendezvousSender<DataReply>,
    ) -> Self {
        Self {
            fs,
            commands,
            replies,
        }
    }

    async fn run(mut self, first_port: u16) {
        let listener = match bind_with_retry(first_port).await {
            Some(listener) => listener,
            None => {
                let _ = self.replies.send(DataReply::Port(None)).await;
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                error!("could not read data socket address: {e}");
                let _ = self.replies.send(DataReply::Port(None)).await;
                return;
            }
        };
        if self.replies.send(DataReply::Port(Some(port))).await.is_err() {
            return;
        }
        debug!("data connection is listening");

        // A transfer command may arrive before the peer has connected; hold
        // it until the accept completes. A CLOSE here means the session is
        // shutting down without a peer ever arriving.
        let mut queued: Option<DataCommand> = None;
        let stream = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted data connection from {peer}");
                        break stream;
                    }
                    Err(e) => {
                        error!("accept failed on data socket: {e}");
                        return;
                    }
                },
                command = self.commands.recv(), if queued.is_none() => match command {
                    Ok(DataCommand::Close) | Err(_) => return,
                    Ok(other) => queued = Some(other),
                },
            }
        };
        // Further connection attempts to this port are no longer serviced.
        drop(listener);

        if self.command_loop(stream, queued).await.is_err() {
            debug!("control side hung up, closing data connection");
        }
    }

    async fn command_loop(
        &mut self,
        mut stream: TcpStream,
        queued: Option<DataCommand>,
    ) -> Result<(), ChannelClosed> {
        let mut next = queued;
        loop {
            let command = match next.take() {
                Some(command) => command,
                None => self.commands.recv().await?,
            };
            match command {
                DataCommand::List(path) => self.process_list(&mut stream, &path).await?,
                DataCommand::Retr(path) => self.process_retr(&mut stream, &path).await?,
                DataCommand::Stor(path) => self.process_stor(&mut stream, &path).await?,
                DataCommand::Continue => warn!("unexpected CONTINUE outside a transfer"),
                DataCommand::Close => break,
            }
        }
        let _ = stream.shutdown().await;
        debug!("data connection closed");
        Ok(())
    }

    /// Writes one listing line per entry to the data socket, then reports
    /// completion on the reply channel.
    async fn process_list(
        &mut self,
        stream: &mut TcpStream,
        path: &VirtualPath,
    ) -> Result<(), ChannelClosed> {
        let lines = if path.is_root() {
            // The root itself enumerates the mount roots as directories.
            match self.fs.list_roots() {
                Ok(roots) => roots
                    .iter()
                    .map(|name| format_list_line("drw-------", 0, name))
                    .collect::<Vec<_>>(),
                Err(e) => {
                    error!("cannot enumerate mount roots: {e}");
                    return self
                        .replies
                        .send(DataReply::Reply("450 Requested file action not taken".into()))
                        .await;
                }
            }
        } else {
            match self.fs.list_children(path) {
                Ok(children) => children
                    .iter()
                    .filter_map(|name| core_path::resolve(path, name))
                    .filter_map(|child| self.file_info(&child))
                    .collect(),
                Err(e) => {
                    error!("cannot list {path}: {e}");
                    return self
                        .replies
                        .send(DataReply::Reply("450 Requested file action not taken".into()))
                        .await;
                }
            }
        };

        for line in lines {
            debug!("{line}");
            if let Err(e) = write_data_line(stream, &line).await {
                error!("error sending listing to peer: {e}");
                break;
            }
        }
        self.replies.send(DataReply::Reply("150 OK".into())).await
    }

    /// Streams a file to the peer. Sends the opening reply, waits for the
    /// CONTINUE order, transfers, then sends the completion reply. The reply
    /// count is fixed so the control side never waits on a reply that is not
    /// coming.
    async fn process_retr(
        &mut self,
        stream: &mut TcpStream,
        path: &VirtualPath,
    ) -> Result<(), ChannelClosed> {
        // The control session validated the target; failure here is a defect.
        let opened = if self.fs.exists(path) && !self.fs.is_directory(path) {
            self.fs.open_read(path).ok()
        } else {
            None
        };
        let Some(mut file) = opened else {
            warn!("RETR target vanished or is not a file: {path}");
            self.replies
                .send(DataReply::Reply("550 File unavailable".into()))
                .await?;
            self.await_continue().await?;
            return self
                .replies
                .send(DataReply::Reply("426 Transfer aborted".into()))
                .await;
        };
        let size = self.fs.size(path).unwrap_or(0);

        self.replies.send(DataReply::Reply("150 OK".into())).await?;
        self.await_continue().await?;

        debug!("starting transfer of {path}, size = {size}");
        let started = Instant::now();
        let mut buffer = [0u8; TRANSFER_CHUNK_SIZE];
        let mut sent: u64 = 0;
        let mut percent_last_logged = 0;
        let mut completed = true;
        loop {
            let read = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    error!("error reading {path}: {e}");
                    completed = false;
                    break;
                }
            };
            if let Err(e) = stream.write_all(&buffer[..read]).await {
                error!("error sending {path} to peer: {e}");
                completed = false;
                break;
            }
            if let Err(e) = stream.flush().await {
                error!("error flushing data socket: {e}");
                completed = false;
                break;
            }
            sent += read as u64;
            if size > 0 {
                // Zero-length transfers skip progress reporting.
                let percent = sent * 100 / size;
                if percent % 10 == 0 && percent != percent_last_logged {
                    percent_last_logged = percent;
                    debug!("{percent}% complete ({sent} bytes)");
                }
            }
        }
        log_transfer_summary("sent", path, sent, started);
        let reply = if completed { "226 OK" } else { "426 Transfer aborted" };
        self.replies.send(DataReply::Reply(reply.into())).await
    }

    /// Receives a file from the peer until it closes its side of the stream.
    async fn process_stor(
        &mut self,
        stream: &mut TcpStream,
        path: &VirtualPath,
    ) -> Result<(), ChannelClosed> {
        // Create the target if missing, clear it if present.
        let prepared = if self.fs.exists(path) && !self.fs.is_directory(path) {
            self.fs.truncate(path)
        } else {
            self.fs.create_file(path)
        };
        let opened = match prepared {
            Ok(()) => self.fs.open_write(path).ok(),
            Err(_) => None,
        };
        let Some(mut file) = opened else {
            warn!("STOR target cannot be opened for writing: {path}");
            self.replies
                .send(DataReply::Reply("450 Cannot create file".into()))
                .await?;
            return self
                .replies
                .send(DataReply::Reply("426 Transfer aborted".into()))
                .await;
        };

        self.replies
            .send(DataReply::Reply("125 Ready to receive".into()))
            .await?;

        debug!("about to receive file {path}");
        let started = Instant::now();
        let mut buffer = [0u8; TRANSFER_CHUNK_SIZE];
        let mut received: u64 = 0;
        let mut completed = true;
        loop {
            let read = match stream.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    error!("error reading from data socket: {e}");
                    completed = false;
                    break;
                }
            };
            if let Err(e) = file.write_all(&buffer[..read]) {
                error!("error writing to {path}: {e}");
                completed = false;
                break;
            }
            received += read as u64;
            if received % (1024 * 1024) == 0 {
                debug!("received {received} bytes");
            }
        }
        if let Err(e) = file.flush() {
            error!("error flushing {path}: {e}");
            completed = false;
        }
        log_transfer_summary("received", path, received, started);
        let reply = if completed {
            "226 File received"
        } else {
            "426 Transfer aborted"
        };
        self.replies.send(DataReply::Reply(reply.into())).await
    }

    /// Waits for the CONTINUE order between the opening and completion
    /// replies of a RETR.
    async fn await_continue(&mut self) -> Result<(), ChannelClosed> {
        match self.commands.recv().await? {
            DataCommand::Continue => Ok(()),
            other => {
                warn!("expected CONTINUE, got {other:?}");
                Ok(())
            }
        }
    }

    fn file_info(&self, path: &VirtualPath) -> Option<String> {
        if !self.fs.exists(path) {
            return None;
        }
        let directory = self.fs.is_directory(path);
        let size = if directory {
            0
        } else {
            self.fs.size(path).unwrap_or(0)
        };
        let mut permissions = String::from(if directory { "d" } else { "-" });
        permissions.push(if self.fs.can_read(path) { 'r' } else { '-' });
        permissions.push(if self.fs.can_write(path) { 'w' } else { '-' });
        permissions.push_str("-------");
        Some(format_list_line(&permissions, size, path.file_name()))
    }
}

async fn bind_with_retry(first_port: u16) -> Option<TcpListener> {
    let mut port = first_port;
    for _ in 0..DATA_BIND_ATTEMPTS {
        debug!("opening data listen socket on port {port}");
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Some(listener),
            Err(e) => {
                warn!("could not bind data port {port}: {e}, trying the next one");
                port = port.wrapping_add(1);
            }
        }
    }
    None
}

async fn write_data_line(stream: &mut TcpStream, line: &str) -> std::io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

/// Fixed placeholder owner/group fields and timestamp; only permissions,
/// size and name vary per entry.
fn format_list_line(permissions: &str, size: u64, name: &str) -> String {
    format!("{permissions}    2 0          5                 {size} Apr 14  2001 {name}")
}

fn log_transfer_summary(direction: &str, path: &VirtualPath, bytes: u64, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        info!(
            "{direction} [{path}] {bytes} bytes in {elapsed:.3}s, average speed {:.1} KB/s",
            bytes as f64 / (elapsed * 1024.0)
        );
    } else {
        info!("{direction} [{path}] {bytes} bytes");
    }
}
