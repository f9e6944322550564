//! Optional collaborators invoked once at startup: router port mapping and
//! announcement to a central directory. Both are no-ops unless configured,
//! and their failures never stop the server.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::{LanshareError, Result};

/// Opens a port on the local router
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Returns whether a mapping is in place afterwards
    async fn map_tcp_port(&self, port: u16) -> Result<bool>;
}

/// Port mapper for builds without a NAT traversal backend
pub struct NoopPortMapper;

#[async_trait]
impl PortMapper for NoopPortMapper {
    async fn map_tcp_port(&self, port: u16) -> Result<bool> {
        tracing::debug!(port, "Port mapping not available");
        Ok(false)
    }
}

/// What a directory learns about this server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAnnouncement {
    pub server_ip: IpAddr,
    pub tcp_port: u16,
    pub name: String,
}

/// Registers the server with a central directory
#[async_trait]
pub trait DirectoryRegistrar: Send + Sync {
    async fn register(&self, announcement: &ServerAnnouncement) -> Result<()>;
}

pub struct NoopRegistrar;

#[async_trait]
impl DirectoryRegistrar for NoopRegistrar {
    async fn register(&self, _announcement: &ServerAnnouncement) -> Result<()> {
        tracing::info!("Directory registration disabled");
        Ok(())
    }
}

/// Posts the announcement as JSON to a directory URL
pub struct HttpRegistrar {
    url: String,
    client: reqwest::Client,
}

impl HttpRegistrar {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LanshareError::External(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl DirectoryRegistrar for HttpRegistrar {
    async fn register(&self, announcement: &ServerAnnouncement) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(announcement)
            .send()
            .await
            .map_err(|e| LanshareError::External(format!("directory request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LanshareError::External(format!("directory returned {status}: {body}")));
        }

        tracing::info!(url = %self.url, "Registered with directory");
        Ok(())
    }
}

/// Pick the collaborators the configuration asks for
pub fn from_config(config: &ServerConfig) -> (Box<dyn PortMapper>, Box<dyn DirectoryRegistrar>) {
    if config.enable_upnp {
        tracing::warn!("UPnP requested but no port mapping backend is available; continuing without it");
    }

    let registrar: Box<dyn DirectoryRegistrar> = match &config.directory_url {
        Some(url) => match HttpRegistrar::new(url.clone()) {
            Ok(registrar) => Box::new(registrar),
            Err(e) => {
                tracing::warn!(error = %e, "Directory registration unavailable");
                Box::new(NoopRegistrar)
            }
        },
        None => Box::new(NoopRegistrar),
    };

    (Box::new(NoopPortMapper), registrar)
}

/// Run both startup hooks, logging instead of failing
pub async fn run_startup_hooks(
    mapper: &dyn PortMapper,
    registrar: &dyn DirectoryRegistrar,
    announcement: &ServerAnnouncement,
) {
    match mapper.map_tcp_port(announcement.tcp_port).await {
        Ok(true) => tracing::info!(port = announcement.tcp_port, "TCP port mapped on router"),
        Ok(false) => {}
        Err(e) => tracing::error!(error = %e, "Port mapping failed"),
    }

    if let Err(e) = registrar.register(announcement).await {
        tracing::error!(error = %e, "Directory registration failed");
    }
}
