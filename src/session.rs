//! Control-connection state machine. One session owns the control socket,
//! parses command lines, validates them against the virtual filesystem view
//! and, for commands needing a data channel, drives a data worker through the
//! rendezvous protocol.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::config::ServerConfig;
use crate::constants::{SOCKET_IN_BUFFER_SIZE, WELCOME_BANNER};
use crate::core_data::{DataChannel, DataOpenError};
use crate::core_fs::VirtualFs;
use crate::core_ipc::DataCommand;
use crate::core_path::{self, VirtualPath};
use crate::error::SessionError;
use crate::watchdog::IdleSupervisor;

/// State of the control-connection state machine. `Terminated` is absorbing:
/// once reached, no further I/O occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// A data worker is listening; RETR/LIST/STOR are legal.
    PassiveWait,
    /// RNFR was accepted; only RNTO completes the rename.
    RenameFrom,
    Terminated,
}

pub struct ControlSession<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    fs: Arc<dyn VirtualFs>,
    state: SessionState,
    cwd: VirtualPath,
    rename_from: Option<VirtualPath>,
    /// State to restore once the RNFR/RNTO pair resolves, either way.
    fallback_state: SessionState,
    data: Option<DataChannel>,
    idle: IdleSupervisor,
    next_data_port: u16,
    /// Comma-separated host part of the PASV reply.
    pasv_host: String,
}

impl<S: AsyncRead + AsyncWrite> ControlSession<S> {
    pub fn new(stream: S, fs: Arc<dyn VirtualFs>, config: &ServerConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let pasv_host = if config.pasv_address.is_empty() {
            error!("unable to determine data connection address, advertising loopback");
            String::from("127,0,0,1")
        } else {
            config.pasv_address.replace('.', ",")
        };
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            fs,
            state: SessionState::Idle,
            cwd: VirtualPath::root(),
            rename_from: None,
            fallback_state: SessionState::Idle,
            data: None,
            idle: IdleSupervisor::new(Duration::from_secs(config.idle_timeout_secs)),
            next_data_port: config.data_port,
            pasv_host,
        }
    }

    /// Runs the session to completion. All exits, normal or not, funnel
    /// through the same shutdown path.
    pub async fn run(mut self) {
        info!("control session started");
        if let Err(e) = send_line(&mut self.writer, WELCOME_BANNER).await {
            error!("could not greet client: {e}");
            self.shutdown().await;
            return;
        }
        match self.main_loop().await {
            Ok(()) => info!("control session finished"),
            Err(SessionError::IdleTimeout) => warn!("idle timeout expired, closing session"),
            Err(e) => error!("control session error: {e}"),
        }
        self.shutdown().await;
    }

    async fn main_loop(&mut self) -> Result<(), SessionError> {
        while self.state != SessionState::Terminated {
            let next = self.process_line().await?;
            debug!("state transition from {:?} to {:?}", self.state, next);
            if self.state == SessionState::RenameFrom && next != SessionState::RenameFrom {
                // A pending rename never survives leaving the rename state.
                self.rename_from = None;
            }
            self.state = next;
        }
        Ok(())
    }

    /// Reads one command line and executes a state machine transition,
    /// returning the next state.
    async fn process_line(&mut self) -> Result<SessionState, SessionError> {
        let line = self.read_line().await?;
        debug!("received [{line}] in state {:?}", self.state);
        let (verb, arg) = split_command(&line);

        // A fixed subset of commands is accepted in any state.
        if let Some(next) = self.dispatch_global(verb, arg).await? {
            return Ok(next);
        }

        match self.state {
            SessionState::Idle => {
                send_line(&mut self.writer, "502 Command not supported").await?;
                Ok(SessionState::Idle)
            }
            SessionState::PassiveWait => match verb {
                "RETR" => self.handle_retr(arg).await,
                "LIST" => self.handle_list(arg).await,
                "STOR" => self.handle_stor(arg).await,
                _ => {
                    send_line(&mut self.writer, "500 Unrecognised command").await?;
                    Ok(SessionState::PassiveWait)
                }
            },
            SessionState::RenameFrom => {
                if verb == "RNTO" {
                    self.handle_rnto(arg).await
                } else {
                    // The rename is abandoned explicitly rather than leaving
                    // the machine stuck awaiting RNTO.
                    send_line(&mut self.writer, "503 Bad sequence of commands").await?;
                    Ok(self.fallback_state)
                }
            }
            SessionState::Terminated => Err(SessionError::StateMachineDefect),
        }
    }

    /// Handles the commands that are legal in every state. Returns `None`
    /// when the verb needs state-specific handling.
    async fn dispatch_global(
        &mut self,
        verb: &str,
        arg: &str,
    ) -> Result<Option<SessionState>, SessionError> {
        let next = match verb {
            "PWD" => {
                let reply = format!("257 \"{}\"", self.cwd);
                send_line(&mut self.writer, &reply).await?;
                self.state
            }
            "TYPE" => self.handle_type(arg).await?,
            "CWD" => self.handle_cwd(arg).await?,
            "MKD" => self.handle_mkd(arg).await?,
            "RNFR" => self.handle_rnfr(arg).await?,
            "noop" => {
                send_line(&mut self.writer, "200 OK").await?;
                self.state
            }
            "QUIT" => SessionState::Terminated,
            "USER" => {
                send_line(&mut self.writer, "230 OK").await?;
                self.state
            }
            "PASV" => self.handle_pasv().await?,
            "SIZE" => self.handle_size(arg).await?,
            _ => return Ok(None),
        };
        Ok(Some(next))
    }

    /// Only (I)mage and (A)scii transfer types are supported.
    async fn handle_type(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        let reply = if arg.eq_ignore_ascii_case("I") || arg.eq_ignore_ascii_case("A") {
            "200 OK"
        } else {
            "504 This type is not supported"
        };
        send_line(&mut self.writer, reply).await?;
        Ok(self.state)
    }

    async fn handle_cwd(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        let validated = core_path::resolve(&self.cwd, arg)
            .filter(|path| path.is_root() || (self.fs.exists(path) && self.fs.is_directory(path)));
        if let Some(path) = validated {
            self.cwd = path;
            send_line(&mut self.writer, "213 OK").await?;
        } else {
            send_line(&mut self.writer, "550 DIRECTORY NOT FOUND").await?;
        }
        Ok(self.state)
    }

    async fn handle_mkd(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        let created = match core_path::resolve(&self.cwd, arg) {
            Some(path) if !path.is_top_level() && !self.fs.exists(&path) => {
                let created = self.fs.create_dir(&path).is_ok();
                if created {
                    info!("created directory {path}");
                }
                created
            }
            _ => false,
        };
        if created {
            send_line(&mut self.writer, "257 Directory created").await?;
        } else {
            send_line(&mut self.writer, "550 Cannot create directory here").await?;
        }
        Ok(self.state)
    }

    async fn handle_rnfr(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        match core_path::resolve(&self.cwd, arg) {
            Some(path) if !path.is_top_level() && self.fs.exists(&path) => {
                // Remember where to fall back to after the RNTO resolves. A
                // repeated RNFR keeps the originally remembered state.
                if self.state != SessionState::RenameFrom {
                    self.fallback_state = self.state;
                }
                self.rename_from = Some(path);
                send_line(&mut self.writer, "350 Command OK").await?;
                Ok(SessionState::RenameFrom)
            }
            _ => {
                send_line(&mut self.writer, "450 Cannot find file").await?;
                Ok(self.state)
            }
        }
    }

    async fn handle_rnto(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        let source = self.rename_from.take();
        let renamed = match (core_path::resolve(&self.cwd, arg), source) {
            (Some(path), Some(source)) if !path.is_top_level() && !self.fs.exists(&path) => {
                let renamed = self.fs.rename(&source, &path).is_ok();
                if renamed {
                    info!("renamed to {path}");
                }
                renamed
            }
            _ => false,
        };
        if renamed {
            send_line(&mut self.writer, "250 Rename action completed").await?;
        } else {
            send_line(&mut self.writer, "553 Cannot rename to this target filename").await?;
        }
        Ok(self.fallback_state)
    }

    async fn handle_size(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        let size = match core_path::resolve(&self.cwd, arg) {
            Some(path) if self.fs.exists(&path) && !self.fs.is_directory(&path) => {
                self.fs.size(&path).ok()
            }
            _ => None,
        };
        match size {
            Some(size) => {
                let reply = format!("213 {size}");
                send_line(&mut self.writer, &reply).await?;
            }
            None => send_line(&mut self.writer, "553 Incorrect path or no such file").await?,
        }
        Ok(self.state)
    }

    /// Spawns a data worker and advertises its port. On failure the session
    /// terminates; the client cannot do anything useful without a data port.
    async fn handle_pasv(&mut self) -> Result<SessionState, SessionError> {
        // A fresh worker per PASV; the previous one is never reused or
        // left listening.
        self.close_data_channel().await;
        match DataChannel::open(Arc::clone(&self.fs), self.next_data_port).await {
            Ok(channel) => {
                let port = channel.port();
                self.next_data_port = port.wrapping_add(1);
                self.data = Some(channel);
                let reply = format!(
                    "227 Entering Passive Mode ({},{},{})",
                    self.pasv_host,
                    port / 256,
                    port % 256
                );
                send_line(&mut self.writer, &reply).await?;
                Ok(SessionState::PassiveWait)
            }
            Err(DataOpenError::NoFreePort) => {
                send_line(&mut self.writer, "421 Cannot open data listen port").await?;
                Ok(SessionState::Terminated)
            }
            Err(DataOpenError::Channel(closed)) => Err(closed.into()),
        }
    }

    async fn handle_list(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        let validated = core_path::resolve(&self.cwd, arg)
            .filter(|path| path.is_root() || (self.fs.exists(path) && self.fs.is_directory(path)));
        if let Some(path) = validated {
            let data = self.data.as_mut().ok_or(SessionError::DataChannelClosed)?;
            data.send(DataCommand::List(path)).await?;
            let reply = data.recv_reply().await?;
            send_line(&mut self.writer, &reply).await?;
            self.close_data_channel().await;
            send_line(&mut self.writer, "226 OK").await?;
        } else {
            send_line(&mut self.writer, "450 Requested file action not taken").await?;
            self.close_data_channel().await;
        }
        Ok(SessionState::Idle)
    }

    async fn handle_retr(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        let validated = core_path::resolve(&self.cwd, arg)
            .filter(|path| self.fs.exists(path) && !self.fs.is_directory(path));
        if let Some(path) = validated {
            info!("retrieving file {path}");
            // The countdown must not run while a transfer is in flight; a
            // slow client is not an idle client.
            self.idle.suspend();
            let relayed = self.relay_retr(path).await;
            self.idle.arm();
            relayed?;
        } else {
            send_line(&mut self.writer, "553 Incorrect path or not such file").await?;
        }
        self.close_data_channel().await;
        Ok(SessionState::Idle)
    }

    /// Fixed RETR sequence: RETR, relay reply, CONTINUE, relay reply.
    async fn relay_retr(&mut self, path: VirtualPath) -> Result<(), SessionError> {
        let data = self.data.as_mut().ok_or(SessionError::DataChannelClosed)?;
        data.send(DataCommand::Retr(path)).await?;
        let opening = data.recv_reply().await?;
        send_line(&mut self.writer, &opening).await?;
        data.send(DataCommand::Continue).await?;
        let completion = data.recv_reply().await?;
        send_line(&mut self.writer, &completion).await?;
        Ok(())
    }

    async fn handle_stor(&mut self, arg: &str) -> Result<SessionState, SessionError> {
        let validated = core_path::resolve(&self.cwd, arg).filter(|path| {
            if path.is_top_level() {
                false
            } else if self.fs.exists(path) {
                // An existing target must be a writable file.
                !self.fs.is_directory(path) && self.fs.can_write(path)
            } else {
                self.fs.create_file(path).is_ok()
            }
        });
        if let Some(path) = validated {
            info!("storing file {path}");
            self.idle.suspend();
            let relayed = self.relay_stor(path).await;
            self.idle.arm();
            relayed?;
        } else {
            send_line(&mut self.writer, "553 Cannot store this file").await?;
        }
        self.close_data_channel().await;
        Ok(SessionState::Idle)
    }

    /// Fixed STOR sequence: STOR, relay two replies (ready, completion).
    async fn relay_stor(&mut self, path: VirtualPath) -> Result<(), SessionError> {
        let data = self.data.as_mut().ok_or(SessionError::DataChannelClosed)?;
        data.send(DataCommand::Stor(path)).await?;
        let ready = data.recv_reply().await?;
        send_line(&mut self.writer, &ready).await?;
        let completion = data.recv_reply().await?;
        send_line(&mut self.writer, &completion).await?;
        Ok(())
    }

    /// Orders a live data worker to terminate and waits for it.
    async fn close_data_channel(&mut self) {
        if let Some(data) = self.data.take() {
            data.close().await;
        }
    }

    /// Reads the next command line, racing the idle countdown. Every read
    /// re-arms the countdown.
    async fn read_line(&mut self) -> Result<String, SessionError> {
        self.idle.arm();
        tokio::select! {
            line = read_command_line(&mut self.reader) => line,
            () = self.idle.expired() => Err(SessionError::IdleTimeout),
        }
    }

    /// Idempotent shutdown; reached from the normal exit, the error path and
    /// the idle timeout alike.
    async fn shutdown(&mut self) {
        debug!("session shutdown");
        self.idle.suspend();
        self.state = SessionState::Terminated;
        self.close_data_channel().await;
        if let Err(e) = self.writer.shutdown().await {
            debug!("control socket close: {e}");
        }
        info!("control session closed");
    }
}

/// Reads one CRLF-terminated line, without the terminator. A bare LF does
/// not terminate a line. Overflowing the buffer or hitting EOF mid-line is
/// a protocol error.
async fn read_command_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, SessionError> {
    let mut buffer: Vec<u8> = Vec::with_capacity(128);
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(SessionError::UnexpectedEof)
            }
            Err(e) => return Err(e.into()),
        };
        buffer.push(byte);
        if buffer.ends_with(b"\r\n") {
            buffer.truncate(buffer.len() - 2);
            return Ok(String::from_utf8_lossy(&buffer).into_owned());
        }
        if buffer.len() >= SOCKET_IN_BUFFER_SIZE {
            return Err(SessionError::LineTooLong(SOCKET_IN_BUFFER_SIZE));
        }
    }
}

/// Splits a command line into the verb and its argument. The argument is
/// everything after the first space, trimmed; the empty string when the
/// line has no space.
fn split_command(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.split_once(' ') {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (line, ""),
    }
}

/// Writes one reply line, CRLF-terminated, flushed immediately.
async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), SessionError> {
    debug!("sending [{line}]");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}
