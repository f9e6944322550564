//! Lanshare - LAN chat and file-sharing server
//!
//! Clients find the server by UDP broadcast, log in over TCP, chat and
//! exchange files in hex-encoded chunks.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanshare::config::{ServerConfig, get_config_file_path};
use lanshare::users::{FileUserStore, Registration, UserStore};

#[derive(Parser)]
#[command(name = "lanshare")]
#[command(about = "LAN chat and file-sharing server", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// TCP port for chat and file transfers
        #[arg(short, long)]
        port: Option<u16>,
        /// UDP port for discovery probes
        #[arg(long)]
        udp_port: Option<u16>,
        /// Directory for uploaded files
        #[arg(long)]
        files_dir: Option<PathBuf>,
    },
    /// Create a user account without starting the server
    AddUser {
        nickname: String,
        password: String,
    },
    /// Write the effective configuration to the config file
    InitConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<(ServerConfig, PathBuf)> {
    let path = match path {
        Some(path) => path.clone(),
        None => get_config_file_path()?,
    };
    let config = ServerConfig::load_or_default(&path)?;
    Ok((config, path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, udp_port, files_dir } => {
            let (mut config, _) = load_config(cli.config.as_ref())?;
            if let Some(port) = port {
                config.tcp_port = port;
            }
            if let Some(udp_port) = udp_port {
                config.udp_port = udp_port;
            }
            if let Some(files_dir) = files_dir {
                config.files_dir = files_dir;
            }

            let _guard = lanshare::logging::init_server_logging(&config.log_file)?;
            lanshare::server::run_server(config).await?;
        }
        Commands::AddUser { nickname, password } => {
            lanshare::logging::init_console_logging();
            let (config, _) = load_config(cli.config.as_ref())?;
            let store = FileUserStore::open(&config.users_file)
                .await
                .with_context(|| format!("Failed to open user store {}", config.users_file.display()))?;

            match store.register(&nickname, &password).await? {
                Registration::Created => println!("✓ User {} created", nickname),
                Registration::AlreadyExists => anyhow::bail!("User {} already exists", nickname),
            }
        }
        Commands::InitConfig => {
            lanshare::logging::init_console_logging();
            let (config, path) = load_config(cli.config.as_ref())?;
            config.save_to_path(&path)?;
            println!("✓ Config written to {}", path.display());
        }
    }

    Ok(())
}
