//! WolfSplit Configuration
//!
//! Configuration structures for the read/write splitting router, the
//! backend server list, the MySQL listener and the admin API.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main WolfSplit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfSplitConfig {
    /// Routing options
    #[serde(default)]
    pub router: RouterConfig,

    /// Backend servers, in priority order
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// MySQL listener configuration
    pub proxy: ProxyConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Policy used to rank slave candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionCriteria {
    /// Fewest connections to the server from anywhere
    LeastGlobalConnections,
    /// Fewest connections opened by this router
    LeastRouterConnections,
    /// Smallest replication lag
    LeastBehindMaster,
    /// Fewest statements in flight
    LeastCurrentOperations,
}

impl std::fmt::Display for SelectionCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionCriteria::LeastGlobalConnections => write!(f, "LEAST_GLOBAL_CONNECTIONS"),
            SelectionCriteria::LeastRouterConnections => write!(f, "LEAST_ROUTER_CONNECTIONS"),
            SelectionCriteria::LeastBehindMaster => write!(f, "LEAST_BEHIND_MASTER"),
            SelectionCriteria::LeastCurrentOperations => write!(f, "LEAST_CURRENT_OPERATIONS"),
        }
    }
}

/// What happens to a session once its master is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    /// Close the session as soon as the master is lost
    FailInstantly,
    /// Keep serving reads, close the session on the next write
    FailOnWrite,
    /// Keep serving reads, answer writes with a read-only error
    ErrorOnWrite,
}

impl std::fmt::Display for MasterFailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterFailureMode::FailInstantly => write!(f, "fail_instantly"),
            MasterFailureMode::FailOnWrite => write!(f, "fail_on_write"),
            MasterFailureMode::ErrorOnWrite => write!(f, "error_on_write"),
        }
    }
}

/// Where user variable writes are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlVariablesIn {
    /// Only on the master; reads of user variables also go to the master
    Master,
    /// On every backend, so any of them can serve reads of the variables
    All,
}

/// Read/write splitting options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Maximum number of slave connections per session (0 = use the percentage)
    #[serde(default = "default_max_slave_connections")]
    pub max_slave_connections: usize,

    /// Maximum slave connections as a percentage of configured servers
    #[serde(default)]
    pub max_slave_connections_percent: usize,

    /// Slave selection policy
    #[serde(default = "default_selection_criteria")]
    pub slave_selection_criteria: SelectionCriteria,

    /// Maximum replication lag in seconds for a slave to be used (0 = no limit)
    #[serde(default)]
    pub max_slave_replication_lag: i64,

    /// Where user variable writes are executed
    #[serde(default = "default_use_sql_variables_in")]
    pub use_sql_variables_in: SqlVariablesIn,

    /// Behaviour after losing the master
    #[serde(default = "default_master_failure_mode")]
    pub master_failure_mode: MasterFailureMode,

    /// Allow the master to serve reads even when slaves are available
    #[serde(default)]
    pub master_accept_reads: bool,

    /// Keep the session on the master after a multi-statement query
    #[serde(default = "default_true")]
    pub strict_multi_stmt: bool,

    /// Lock the session to the master after a stored procedure call
    #[serde(default)]
    pub strict_sp_calls: bool,

    /// Maximum number of session commands kept for replay (0 = unlimited)
    #[serde(default)]
    pub max_sescmd_history: usize,

    /// Don't keep session command history at all
    #[serde(default)]
    pub disable_sescmd_history: bool,

    /// Retry reads on another slave when the chosen one fails
    #[serde(default = "default_true")]
    pub retry_failed_reads: bool,
}

/// Role assigned to a backend in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfiguredRole {
    Master,
    Slave,
    Relay,
    None,
}

/// Backend server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name, used in hints and the admin API
    pub name: String,

    /// Server host
    pub address: String,

    /// Server port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Initial replication role
    #[serde(default = "default_role")]
    pub role: ConfiguredRole,

    /// Selection weight (0 = only used when nothing else is available)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Replication depth, the root master has the lowest one
    #[serde(default)]
    pub depth: i32,

    /// Last known replication lag in seconds
    #[serde(default)]
    pub replication_lag: Option<u32>,

    /// Start the server in maintenance mode
    #[serde(default)]
    pub maintenance: bool,
}

/// MySQL listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// MySQL listener bind address
    #[serde(default = "default_proxy_address")]
    pub bind_address: String,

    /// User the clients authenticate as, also used towards the backends
    pub user: String,

    /// Password for `user`
    #[serde(default)]
    pub password: String,

    /// Version string announced in the handshake
    #[serde(default = "default_server_version")]
    pub server_version: String,

    /// Backend connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds a backend may stay silent on an outstanding reply before it
    /// is reported as unresponsive (0 disables the check)
    #[serde(default = "default_backend_read_timeout")]
    pub backend_read_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_max_slave_connections() -> usize {
    1
}

fn default_selection_criteria() -> SelectionCriteria {
    SelectionCriteria::LeastCurrentOperations
}

fn default_use_sql_variables_in() -> SqlVariablesIn {
    SqlVariablesIn::All
}

fn default_master_failure_mode() -> MasterFailureMode {
    MasterFailureMode::FailInstantly
}

fn default_db_port() -> u16 {
    3306
}

fn default_role() -> ConfiguredRole {
    ConfiguredRole::Slave
}

fn default_weight() -> u32 {
    1000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_backend_read_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:8989".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_proxy_address() -> String {
    "0.0.0.0:4006".to_string()
}

fn default_server_version() -> String {
    "10.6.0-WolfSplit".to_string()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_slave_connections: default_max_slave_connections(),
            max_slave_connections_percent: 0,
            slave_selection_criteria: default_selection_criteria(),
            max_slave_replication_lag: 0,
            use_sql_variables_in: default_use_sql_variables_in(),
            master_failure_mode: default_master_failure_mode(),
            master_accept_reads: false,
            strict_multi_stmt: true,
            strict_sp_calls: false,
            max_sescmd_history: 0,
            disable_sescmd_history: false,
            retry_failed_reads: true,
        }
    }
}

impl RouterConfig {
    /// Lag ceiling for slave selection, `None` when unlimited
    pub fn max_replication_lag(&self) -> Option<u32> {
        if self.max_slave_replication_lag > 0 {
            Some(self.max_slave_replication_lag.min(u32::MAX as i64) as u32)
        } else {
            None
        }
    }

    /// Maximum number of slaves a session may hold given `n_servers` configured servers
    pub fn max_slave_count(&self, n_servers: usize) -> usize {
        let configured = if self.max_slave_connections > 0 {
            self.max_slave_connections
        } else {
            n_servers * self.max_slave_connections_percent / 100
        };
        configured.max(1).min(n_servers.saturating_sub(1))
    }

    /// History limit, `None` when unlimited
    pub fn history_limit(&self) -> Option<usize> {
        if self.max_sescmd_history > 0 {
            Some(self.max_sescmd_history)
        } else {
            None
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Socket address of the server
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl ProxyConfig {
    /// Get the backend connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Silence allowed on an outstanding backend reply, `None` when unchecked
    pub fn backend_read_timeout(&self) -> Option<Duration> {
        (self.backend_read_timeout_secs > 0).then(|| Duration::from_secs(self.backend_read_timeout_secs))
    }
}

impl WolfSplitConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSplitConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.servers.is_empty() {
            return Err(crate::Error::Config("at least one [[servers]] entry is required".into()));
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(crate::Error::Config("servers.name cannot be empty".into()));
            }
            if server.address.is_empty() {
                return Err(crate::Error::Config(format!(
                    "servers.address cannot be empty for '{}'",
                    server.name
                )));
            }
            if !names.insert(server.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }

        if self.router.max_slave_connections_percent > 100 {
            return Err(crate::Error::Config(
                "router.max_slave_connections_percent cannot exceed 100".into(),
            ));
        }

        if self.proxy.user.is_empty() {
            return Err(crate::Error::Config("proxy.user cannot be empty".into()));
        }

        Ok(())
    }
}
