use std::path::PathBuf;

use clap::Parser;

/// Remote restarts for VPN tunnel containers.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the env file with the server settings.
    #[arg(short, long, default_value = ".env")]
    pub env_file: PathBuf,

    /// Address to listen on. Overrides SERVER_IP.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on. Overrides SERVER_PORT.
    #[arg(short, long)]
    pub port: Option<u16>,
}
