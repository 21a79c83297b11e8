//! Router instance and statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::BackendServer;
use crate::classifier::{KeywordClassifier, QueryClassifier};
use crate::config::{RouterConfig, WolfSplitConfig};
use crate::error::{Error, Result};
use crate::server::{ServerRegistry, ServerSnapshot};

/// Router-wide counters
#[derive(Debug, Default)]
pub struct RouterStats {
    n_sessions: AtomicU64,
    n_current: AtomicU64,
    n_queries: AtomicU64,
    n_master: AtomicU64,
    n_slave: AtomicU64,
    n_all: AtomicU64,
}

/// Serializable copy of [`RouterStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sessions_total: u64,
    pub sessions_current: u64,
    pub queries: u64,
    pub routed_to_master: u64,
    pub routed_to_slave: u64,
    pub routed_to_all: u64,
}

impl RouterStats {
    pub fn session_opened(&self) {
        self.n_sessions.fetch_add(1, Ordering::Relaxed);
        self.n_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        let _ = self
            .n_current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn query_forwarded(&self) {
        self.n_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routed_to_master(&self) {
        self.n_master.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routed_to_slave(&self) {
        self.n_slave.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routed_to_all(&self) {
        self.n_all.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_total: self.n_sessions.load(Ordering::Relaxed),
            sessions_current: self.n_current.load(Ordering::Relaxed),
            queries: self.n_queries.load(Ordering::Relaxed),
            routed_to_master: self.n_master.load(Ordering::Relaxed),
            routed_to_slave: self.n_slave.load(Ordering::Relaxed),
            routed_to_all: self.n_all.load(Ordering::Relaxed),
        }
    }
}

/// Per-server part of the diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ServerDiagnostics {
    #[serde(flatten)]
    pub server: ServerSnapshot,
    pub router_connections: usize,
}

/// Everything `GET /stats` reports
#[derive(Debug, Clone, Serialize)]
pub struct RouterDiagnostics {
    pub options: RouterConfig,
    pub stats: StatsSnapshot,
    /// Share of forwarded queries that went to the master, in percent
    pub master_percent: f64,
    pub slave_percent: f64,
    pub all_percent: f64,
    pub servers: Vec<ServerDiagnostics>,
}

/// Shared state of one read/write splitting service
pub struct RouterInstance {
    config: RouterConfig,
    registry: ServerRegistry,
    backends: Vec<Arc<BackendServer>>,
    classifier: Arc<dyn QueryClassifier>,
    stats: RouterStats,
}

impl RouterInstance {
    pub fn new(config: RouterConfig, registry: ServerRegistry, classifier: Arc<dyn QueryClassifier>) -> Result<Self> {
        if registry.is_empty() {
            return Err(Error::Config("router needs at least one server".into()));
        }
        let backends = registry
            .iter()
            .map(|server| Arc::new(BackendServer::new(server.clone())))
            .collect();

        tracing::info!(
            "Read/write split router created: {} servers, max_slave_connections={}, criteria={}, master_failure_mode={}",
            registry.len(),
            config.max_slave_connections,
            config.slave_selection_criteria,
            config.master_failure_mode
        );

        Ok(Self {
            config,
            registry,
            backends,
            classifier,
            stats: RouterStats::default(),
        })
    }

    /// Build the instance from the full configuration with the keyword classifier
    pub fn from_config(config: &WolfSplitConfig) -> Result<Self> {
        let registry = ServerRegistry::from_config(&config.servers)?;
        Self::new(config.router.clone(), registry, Arc::new(KeywordClassifier::new()))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Servers in configuration order
    pub fn backends(&self) -> &[Arc<BackendServer>] {
        &self.backends
    }

    pub fn classifier(&self) -> &dyn QueryClassifier {
        self.classifier.as_ref()
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Slave connections each session may hold
    pub fn max_slave_count(&self) -> usize {
        self.config.max_slave_count(self.backends.len())
    }

    pub fn diagnostics(&self) -> RouterDiagnostics {
        let stats = self.stats.snapshot();
        let percent = |n: u64| {
            if stats.queries == 0 {
                0.0
            } else {
                (n as f64 / stats.queries as f64) * 100.0
            }
        };

        RouterDiagnostics {
            options: self.config.clone(),
            stats,
            master_percent: percent(stats.routed_to_master),
            slave_percent: percent(stats.routed_to_slave),
            all_percent: percent(stats.routed_to_all),
            servers: self
                .backends
                .iter()
                .map(|b| ServerDiagnostics {
                    server: b.server().snapshot(),
                    router_connections: b.router_connections(),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for RouterInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterInstance")
            .field("config", &self.config)
            .field("servers", &self.backends.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[router]
max_slave_connections = 2

[[servers]]
name = "db1"
address = "10.0.0.1"
role = "master"

[[servers]]
name = "db2"
address = "10.0.0.2"

[[servers]]
name = "db3"
address = "10.0.0.3"

[proxy]
user = "app"
password = "secret"
"#;

    #[test]
    fn test_from_config() {
        let config = WolfSplitConfig::from_str(CONFIG).unwrap();
        let instance = RouterInstance::from_config(&config).unwrap();
        assert_eq!(instance.backends().len(), 3);
        assert_eq!(instance.max_slave_count(), 2);
        assert!(instance.registry().get("db2").is_some());
    }

    #[test]
    fn test_stats_and_diagnostics() {
        let config = WolfSplitConfig::from_str(CONFIG).unwrap();
        let instance = RouterInstance::from_config(&config).unwrap();

        instance.stats().session_opened();
        instance.stats().query_forwarded();
        instance.stats().query_forwarded();
        instance.stats().routed_to_master();
        instance.stats().routed_to_slave();
        instance.stats().session_closed();
        instance.stats().session_closed();

        let diag = instance.diagnostics();
        assert_eq!(diag.stats.sessions_total, 1);
        assert_eq!(diag.stats.sessions_current, 0);
        assert_eq!(diag.stats.queries, 2);
        assert_eq!(diag.master_percent, 50.0);
        assert_eq!(diag.servers.len(), 3);

        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["servers"][0]["name"], "db1");
        assert_eq!(json["options"]["slave_selection_criteria"], "LEAST_CURRENT_OPERATIONS");
    }
}
