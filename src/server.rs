//! Backend Server Descriptors
//!
//! Cluster-wide view of each backend server: role, health, weight,
//! replication lag and connection counters. Descriptors are shared by every
//! session through `Arc` and updated with atomics, so routing never takes a
//! lock to read them. Role and health are written by whoever plays the
//! monitor (the configuration at start-up and the admin API afterwards).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ConfiguredRole, ServerConfig};
use crate::error::{Error, Result};

const LAG_UNKNOWN: i64 = -1;

/// Replication role of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Accepts writes
    Master,
    /// Replicates from a master
    Slave,
    /// Intermediate master, replicating and being replicated from
    Relay,
    /// Not part of replication
    None,
}

impl ServerRole {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerRole::Master,
            2 => ServerRole::Slave,
            3 => ServerRole::Relay,
            _ => ServerRole::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServerRole::Master => 1,
            ServerRole::Slave => 2,
            ServerRole::Relay => 3,
            ServerRole::None => 0,
        }
    }
}

impl From<ConfiguredRole> for ServerRole {
    fn from(role: ConfiguredRole) -> Self {
        match role {
            ConfiguredRole::Master => ServerRole::Master,
            ConfiguredRole::Slave => ServerRole::Slave,
            ConfiguredRole::Relay => ServerRole::Relay,
            ConfiguredRole::None => ServerRole::None,
        }
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Master => write!(f, "MASTER"),
            ServerRole::Slave => write!(f, "SLAVE"),
            ServerRole::Relay => write!(f, "RELAY"),
            ServerRole::None => write!(f, "NONE"),
        }
    }
}

/// Shared state of one backend server
#[derive(Debug)]
pub struct ServerDescriptor {
    name: String,
    address: String,
    port: u16,
    role: AtomicU8,
    running: AtomicBool,
    maintenance: AtomicBool,
    weight: AtomicU32,
    depth: AtomicI32,
    rlag: AtomicI64,
    n_current: AtomicUsize,
    n_current_ops: AtomicUsize,
}

impl ServerDescriptor {
    /// Create a running server with the given role
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, role: ServerRole) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            role: AtomicU8::new(role.as_u8()),
            running: AtomicBool::new(true),
            maintenance: AtomicBool::new(false),
            weight: AtomicU32::new(1000),
            depth: AtomicI32::new(0),
            rlag: AtomicI64::new(LAG_UNKNOWN),
            n_current: AtomicUsize::new(0),
            n_current_ops: AtomicUsize::new(0),
        }
    }

    /// Create a descriptor from its configuration entry
    pub fn from_config(config: &ServerConfig) -> Self {
        let server = Self::new(&config.name, &config.address, config.port, config.role.into());
        server.set_weight(config.weight);
        server.set_depth(config.depth);
        server.set_replication_lag(config.replication_lag);
        server.set_maintenance(config.maintenance);
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` string for connecting
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn role(&self) -> ServerRole {
        ServerRole::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: ServerRole) {
        self.role.store(role.as_u8(), Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::Release);
    }

    /// Master role, running and not in maintenance
    pub fn is_master(&self) -> bool {
        self.is_usable() && self.role() == ServerRole::Master
    }

    /// Slave role, running and not in maintenance
    pub fn is_slave(&self) -> bool {
        self.is_usable() && self.role() == ServerRole::Slave
    }

    /// Relay master, running and not in maintenance
    pub fn is_relay(&self) -> bool {
        self.is_usable() && self.role() == ServerRole::Relay
    }

    /// Running and not in maintenance
    pub fn is_usable(&self) -> bool {
        self.is_running() && !self.in_maintenance()
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn depth(&self) -> i32 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn set_depth(&self, depth: i32) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// Replication lag in seconds, `None` when the monitor doesn't know it
    pub fn replication_lag(&self) -> Option<u32> {
        let lag = self.rlag.load(Ordering::Relaxed);
        if lag < 0 {
            None
        } else {
            Some(lag.min(u32::MAX as i64) as u32)
        }
    }

    pub fn set_replication_lag(&self, lag: Option<u32>) {
        let value = lag.map(i64::from).unwrap_or(LAG_UNKNOWN);
        self.rlag.store(value, Ordering::Relaxed);
    }

    /// Connections currently open to this server
    pub fn current_connections(&self) -> usize {
        self.n_current.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.n_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .n_current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Statements currently waiting for a reply from this server
    pub fn current_operations(&self) -> usize {
        self.n_current_ops.load(Ordering::Relaxed)
    }

    pub fn operation_started(&self) {
        self.n_current_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_finished(&self) {
        let _ = self
            .n_current_ops
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Point-in-time copy for reporting
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            name: self.name.clone(),
            address: self.socket_address(),
            role: self.role(),
            running: self.is_running(),
            maintenance: self.in_maintenance(),
            weight: self.weight(),
            depth: self.depth(),
            replication_lag: self.replication_lag(),
            connections: self.current_connections(),
            operations: self.current_operations(),
        }
    }

    /// Apply a monitor update
    pub fn apply(&self, update: &ServerUpdate) {
        if let Some(role) = update.role {
            self.set_role(role);
        }
        if let Some(running) = update.running {
            self.set_running(running);
        }
        if let Some(maintenance) = update.maintenance {
            self.set_maintenance(maintenance);
        }
        if let Some(weight) = update.weight {
            self.set_weight(weight);
        }
        if let Some(depth) = update.depth {
            self.set_depth(depth);
        }
        if let Some(lag) = update.replication_lag {
            self.set_replication_lag(if lag < 0 { None } else { Some(lag as u32) });
        }
    }
}

/// Serializable view of a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub address: String,
    pub role: ServerRole,
    pub running: bool,
    pub maintenance: bool,
    pub weight: u32,
    pub depth: i32,
    pub replication_lag: Option<u32>,
    pub connections: usize,
    pub operations: usize,
}

/// Partial update of a server's monitored state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerUpdate {
    #[serde(default)]
    pub role: Option<ServerRole>,
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default)]
    pub maintenance: Option<bool>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub depth: Option<i32>,
    /// Negative means unknown
    #[serde(default)]
    pub replication_lag: Option<i64>,
}

/// All configured servers, in configuration order
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Vec<Arc<ServerDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl ServerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration entries
    pub fn from_config(configs: &[ServerConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.add(Arc::new(ServerDescriptor::from_config(config)))?;
        }
        Ok(registry)
    }

    /// Add a server, names must be unique
    pub fn add(&mut self, server: Arc<ServerDescriptor>) -> Result<()> {
        if self.by_name.contains_key(server.name()) {
            return Err(Error::Config(format!("duplicate server name '{}'", server.name())));
        }
        self.by_name.insert(server.name().to_string(), self.servers.len());
        self.servers.push(server);
        Ok(())
    }

    /// Look a server up by name
    pub fn get(&self, name: &str) -> Option<&Arc<ServerDescriptor>> {
        self.by_name.get(name).map(|&idx| &self.servers[idx])
    }

    /// Apply a monitor update to a named server
    pub fn update(&self, name: &str, update: &ServerUpdate) -> Result<ServerSnapshot> {
        let server = self
            .get(name)
            .ok_or_else(|| Error::UnknownServer(name.to_string()))?;
        server.apply(update);
        tracing::info!(
            "Server '{}' updated: role={} running={} maintenance={} lag={:?}",
            name,
            server.role(),
            server.is_running(),
            server.in_maintenance(),
            server.replication_lag()
        );
        Ok(server.snapshot())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerDescriptor>> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Snapshots of all servers
    pub fn snapshots(&self) -> Vec<ServerSnapshot> {
        self.servers.iter().map(|s| s.snapshot()).collect()
    }
}
