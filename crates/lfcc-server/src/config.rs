//! Command line and configuration file.

use anyhow::{Context, Result};
use clap::Parser;
use lfcc_core::{CompactionPolicy, EngineConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lfcc-server")]
#[command(about = "LFCC document sync server")]
pub struct Args {
    /// Address to listen on for WebSocket connections
    #[arg(short, long, default_value = "0.0.0.0:8787")]
    pub listen: String,

    /// Directory holding snapshots and update logs
    #[arg(short, long, default_value = "./lfcc-data")]
    pub data_dir: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server id used as the sender of server messages (generated if not provided)
    #[arg(long)]
    pub server_id: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

/// Contents of the configuration file. Every section is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub compaction: CompactionPolicy,

    /// How often timeouts and presence expiry are checked
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            compaction: CompactionPolicy::default(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .engine
            .manifest
            .validate()
            .context("Invalid policy manifest in config")?;
        Ok(config)
    }

    /// Load the configured file (if any) and apply command-line overrides.
    ///
    /// A server left with the built-in id gets a generated one.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        match &args.server_id {
            Some(server_id) => config.engine.server_id = server_id.clone(),
            None if config.engine.server_id == EngineConfig::default().server_id => {
                let id = uuid::Uuid::new_v4().to_string();
                info!("Generated server ID: {}", id);
                config.engine.server_id = id;
            }
            None => {}
        }
        Ok(config)
    }
}
