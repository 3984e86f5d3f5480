pub mod config;
pub mod constants;
pub mod core_cli;
pub mod core_data;
pub mod core_fs;
pub mod core_ipc;
pub mod core_path;
pub mod error;
pub mod server;
pub mod session;
pub mod watchdog;
