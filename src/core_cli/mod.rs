use clap::Parser;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "pocketftpd", about = "A single-client passive-mode FTP server.")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "")]
    pub config: String,

    /// Override the control listen port from the configuration file
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Enable verbose mode
    #[arg(short, long)]
    pub verbose: bool,
}
