use std::fs;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};

use pocketftpd::config::Config;
use pocketftpd::core_cli::Cli;
use pocketftpd::core_fs::LocalFs;
use pocketftpd::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Initialize the logger with a custom format
    let default_filter = if args.verbose { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            writeln!(
                buf,
                "[{}] [{}] {}",
                timestamp,
                record.level(),
                record.args()
            )
        })
        .init();

    // Determine the default config path based on the OS
    let default_config_path = if cfg!(target_os = "windows") {
        "C:\\pocketftpd\\etc\\pocketftpd.conf"
    } else {
        "/etc/pocketftpd.conf"
    };

    let config_path = if args.config.is_empty() {
        default_config_path
    } else {
        args.config.as_str()
    };
    let mut config = load_config(config_path)?;

    // Override the listen port from the CLI if provided
    if let Some(port) = args.port {
        config.server.listen_port = port;
    }

    let fs = Arc::new(LocalFs::new(config.server.chroot_dir.as_str()));

    server::run(Arc::new(config), fs).await
}

fn load_config(path: &str) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file: {}", path))?;
    let config = toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse configuration file: {}", path))?;
    Ok(config)
}
