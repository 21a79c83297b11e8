//! MySQL Proxy Server
//!
//! TCP listener that accepts MySQL clients and hands every connection to its
//! own session task. The router instance is shared by all of them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::router::RouterInstance;

use super::client::handle_client;

/// MySQL proxy server
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    instance: Arc<RouterInstance>,
    next_connection_id: AtomicU32,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, instance: Arc<RouterInstance>) -> Self {
        Self {
            config: Arc::new(config),
            instance,
            next_connection_id: AtomicU32::new(1),
        }
    }

    pub fn instance(&self) -> &Arc<RouterInstance> {
        &self.instance
    }

    /// Bind the listener and serve until the task is dropped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("MySQL proxy listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Accept clients from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (client_socket, addr) = listener.accept().await?;
            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("New MySQL client connection {} from {}", connection_id, addr);

            let config = Arc::clone(&self.config);
            let instance = Arc::clone(&self.instance);

            tokio::spawn(async move {
                if let Err(e) = handle_client(client_socket, addr, connection_id, instance, config).await {
                    tracing::error!("Proxy connection error: {}", e);
                }
            });
        }
    }
}
