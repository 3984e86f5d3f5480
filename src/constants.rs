// src/constants.rs

/// Size of the buffer used when reading a command line from the control socket.
/// A line that fills the buffer without a CRLF terminator is a protocol error.
pub const SOCKET_IN_BUFFER_SIZE: usize = 4096;

/// Chunk size used when streaming file data over the data socket.
pub const TRANSFER_CHUNK_SIZE: usize = 64;

/// How many consecutive ports the data worker tries before giving up.
pub const DATA_BIND_ATTEMPTS: u32 = 10;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_DATA_PORT: u16 = 5001;

pub const WELCOME_BANNER: &str = "220 Welcome to pocketftpd";
