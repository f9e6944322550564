//! Lanshare server - accepts TCP clients, spawns a session per connection and
//! answers discovery probes

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ServerConfig;
use crate::discovery::DiscoveryResponder;
use crate::external::{self, ServerAnnouncement};
use crate::framing::run_writer;
use crate::registry::{BroadcastRegistry, Outbound};
use crate::session::{ServerContext, Session};
use crate::transfer::FileStore;
use crate::users::{FileUserStore, UserStore};

/// Build the shared context from configuration: opens the files directory
/// and the user store
pub async fn build_context(config: &ServerConfig) -> Result<ServerContext> {
    let files = FileStore::open(&config.files_dir)
        .await
        .with_context(|| format!("Failed to open files directory {}", config.files_dir.display()))?;
    let users = FileUserStore::open(&config.users_file)
        .await
        .with_context(|| format!("Failed to open user store {}", config.users_file.display()))?;

    Ok(ServerContext {
        registry: Arc::new(BroadcastRegistry::with_stall_timeout(Duration::from_secs(config.send_stall_secs))),
        users: Arc::new(users) as Arc<dyn UserStore>,
        files: Arc::new(files),
        max_frame_bytes: config.max_frame_bytes,
        outbound_queue: config.outbound_queue,
        outbound_budget_bytes: config.outbound_budget_bytes,
    })
}

/// Pause after a failed accept so a persistent error (out of descriptors)
/// does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A server whose sockets are bound but not yet serving
pub struct ChatServer {
    listener: TcpListener,
    discovery: Option<DiscoveryResponder>,
    ctx: ServerContext,
    next_id: AtomicU64,
}

impl ChatServer {
    /// Bind the TCP listener and the discovery socket. Only a TCP bind
    /// failure is an error; without discovery the server still runs.
    pub async fn bind(config: &ServerConfig, ctx: ServerContext) -> Result<Self> {
        let tcp_addr = format!("{}:{}", config.bind_address, config.tcp_port);
        let listener = TcpListener::bind(&tcp_addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {tcp_addr}"))?;
        let tcp_port = listener.local_addr()?.port();

        let udp_addr = format!("{}:{}", config.bind_address, config.udp_port);
        let discovery = match DiscoveryResponder::bind(&udp_addr, tcp_port).await {
            Ok(responder) => Some(responder),
            Err(e) => {
                tracing::error!(addr = %udp_addr, error = %e, "Discovery unavailable");
                None
            }
        };

        Ok(Self {
            listener,
            discovery,
            ctx,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().and_then(|d| d.local_addr().ok())
    }

    /// Serve until the process ends
    pub async fn run(mut self) -> Result<()> {
        if let Some(discovery) = self.discovery.take() {
            tokio::spawn(discovery.run());
        }

        tracing::info!(addr = %self.listener.local_addr()?, "TCP server listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(peer = %peer, id, "Accepted connection");
                    spawn_connection(self.ctx.clone(), stream, peer, id);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Split the stream, start its writer task and run the session on the read half
fn spawn_connection(ctx: ServerContext, stream: TcpStream, peer: SocketAddr, id: u64) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let (outbound, frames) = Outbound::new(id, peer, ctx.outbound_queue, ctx.outbound_budget_bytes);
    tokio::spawn(run_writer(write_half, frames, outbound.shutdown_token()));

    tokio::spawn(async move {
        let session = Session::new(ctx, outbound);
        session.run(read_half).await;
    });
}

/// Start the server from configuration and serve forever
pub async fn run_server(config: ServerConfig) -> Result<()> {
    config.validate()?;
    let ctx = build_context(&config).await?;
    let server = ChatServer::bind(&config, ctx).await?;
    let tcp_port = server.local_addr()?.port();

    let (mapper, registrar) = external::from_config(&config);
    let announcement = ServerAnnouncement {
        server_ip: crate::discovery::outbound_ip_for(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))),
        tcp_port,
        name: hostname_or_default(),
    };
    external::run_startup_hooks(mapper.as_ref(), registrar.as_ref(), &announcement).await;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Lanshare Server Online                    ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("  Address:   {}:{}", announcement.server_ip, tcp_port);
    if let Some(addr) = server.discovery_addr() {
        println!("  Discovery: UDP {}", addr.port());
    }
    println!("  Files:     {}", config.files_dir.display());
    println!("\n─────────────────────────────────────────────────────────────────\n");

    tokio::select! {
        res = server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            println!("\r\nShutting down...");
            Ok(())
        }
    }
}

fn hostname_or_default() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read host name");
            "lanshare".to_string()
        }
    }
}
