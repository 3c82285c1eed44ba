use std::path::PathBuf;

use clap::Parser;

use crate::utils::data_dir;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding the per-agent databases; defaults to the platform
    /// data directory
    #[arg(long, default_value_os_t = data_dir())]
    pub data_dir: PathBuf,
    /// The port to listen on
    #[arg(default_value_t = 3000)]
    pub port: u16,
    /// The leading path segment agents are routed under
    #[arg(long, default_value = "agents")]
    pub prefix: String,
}
