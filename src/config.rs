use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_DATA_PORT, DEFAULT_IDLE_TIMEOUT_SECS};

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub listen_port: u16,
    /// Public IP address advertised in the PASV reply.
    pub pasv_address: String,
    /// Directory the virtual root is mapped onto. Its immediate children act
    /// as the mount roots visible to the client.
    pub chroot_dir: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// First port the data worker attempts to listen on.
    #[serde(default = "default_data_port")]
    pub data_port: u16,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 21,
            pasv_address: String::from("127.0.0.1"),
            chroot_dir: String::from("/var/ftp"),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            data_port: DEFAULT_DATA_PORT,
        }
    }
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}
