use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};

/// Server configuration, stored as JSON. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP and UDP sockets bind to
    pub bind_address: String,
    /// TCP port for the chat and file service
    pub tcp_port: u16,
    /// UDP port answering discovery probes
    pub udp_port: u16,
    /// Directory holding uploaded files
    pub files_dir: PathBuf,
    /// JSON file holding user accounts
    pub users_file: PathBuf,
    /// Server log file
    pub log_file: PathBuf,
    /// Longest accepted protocol line in bytes
    pub max_frame_bytes: usize,
    /// Frames queued per connection
    pub outbound_queue: usize,
    /// Bytes of unwritten frames allowed per connection
    pub outbound_budget_bytes: usize,
    /// Seconds a broadcast waits on a full connection before dropping it
    pub send_stall_secs: u64,
    /// Ask the router for a port mapping at startup
    pub enable_upnp: bool,
    /// Directory service to announce the server to, if any
    pub directory_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = get_data_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            bind_address: "0.0.0.0".to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            files_dir: data_dir.join("uploaded_files"),
            users_file: data_dir.join("users.json"),
            log_file: data_dir.join("server.log"),
            // a 4 MiB chunk is 8 MiB of hex plus the JSON envelope
            max_frame_bytes: 16 * 1024 * 1024,
            outbound_queue: 256,
            outbound_budget_bytes: 32 * 1024 * 1024,
            send_stall_secs: 10,
            enable_upnp: false,
            directory_url: None,
        }
    }
}

impl ServerConfig {
    /// Load from `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;

        let config: ServerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory at {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file at {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes < 1024 {
            anyhow::bail!("max_frame_bytes must be at least 1024, got {}", self.max_frame_bytes);
        }
        if self.outbound_queue == 0 {
            anyhow::bail!("outbound_queue must be at least 1");
        }
        if self.outbound_budget_bytes < 1024 {
            anyhow::bail!("outbound_budget_bytes must be at least 1024, got {}", self.outbound_budget_bytes);
        }
        if self.send_stall_secs == 0 {
            anyhow::bail!("send_stall_secs must be at least 1");
        }
        Ok(())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("net", "lanshare", "lanshare").context("Failed to determine project directories")
}

/// Get the default config directory
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Get the default data directory
pub fn get_data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Get the path to the config file
pub fn get_config_file_path() -> Result<PathBuf> {
    let config_dir = get_config_dir()?;
    Ok(config_dir.join("config.json"))
}
