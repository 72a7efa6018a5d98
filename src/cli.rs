use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "nicocache", about = "Caching proxy for streamed video", version)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./nicocache.toml, written with defaults
    /// when missing).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Optional file whose values override the main configuration
    /// (defaults to <config stem>.local.toml next to it).
    #[arg(long)]
    pub local_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
