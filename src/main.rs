//! WolfSplit - Read/Write Splitting Router for MariaDB
//!
//! Listens for MySQL clients, sends writes to the master and spreads reads
//! over the slaves of the configured cluster.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsplit::api::HttpServer;
use wolfsplit::config::WolfSplitConfig;
use wolfsplit::error::Result;
use wolfsplit::proxy::ProxyServer;
use wolfsplit::router::RouterInstance;

/// WolfSplit - Read/Write Splitting Router for MariaDB
#[derive(Parser)]
#[command(name = "wolfsplit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsplit.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsplit.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show router configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_init(output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            run_validate(cli.config)
        }
        Commands::Info => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            run_info(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the router: MySQL listener plus HTTP API
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = WolfSplitConfig::from_file(&config_path)?;
    init_logging(log_level.as_deref().unwrap_or(&config.logging.level));

    tracing::info!("Starting WolfSplit");
    tracing::info!("Configuration: {}", config_path.display());

    let instance = Arc::new(RouterInstance::from_config(&config)?);
    for server in instance.registry().iter() {
        tracing::info!(
            "Server '{}' at {} role={} weight={}",
            server.name(),
            server.socket_address(),
            server.role(),
            server.weight()
        );
    }

    let http_server = HttpServer::new(config.api.clone(), Arc::clone(&instance));
    let http_server_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let proxy = ProxyServer::new(config.proxy.clone(), Arc::clone(&instance));

    tokio::select! {
        result = proxy.start() => {
            if let Err(e) = result {
                tracing::error!("Proxy error: {}", e);
                http_server_handle.abort();
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    http_server_handle.abort();
    let stats = instance.stats().snapshot();
    tracing::info!(
        "WolfSplit shutdown complete: {} sessions, {} queries routed",
        stats.sessions_total,
        stats.queries
    );
    Ok(())
}

/// Write an example configuration
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = r#"# WolfSplit Configuration
# Generated configuration file

[router]
max_slave_connections = 1
slave_selection_criteria = "LEAST_CURRENT_OPERATIONS"
# max_slave_replication_lag = 30
use_sql_variables_in = "all"
master_failure_mode = "fail_instantly"
master_accept_reads = false
strict_multi_stmt = true
strict_sp_calls = false
max_sescmd_history = 0
retry_failed_reads = true

[[servers]]
name = "db1"
address = "10.0.0.1"
port = 3306
role = "master"

[[servers]]
name = "db2"
address = "10.0.0.2"
port = 3306
role = "slave"

[[servers]]
name = "db3"
address = "10.0.0.3"
port = 3306
role = "slave"
# weight = 1000

[proxy]
bind_address = "0.0.0.0:4006"
user = "app"
password = "changeme"
connect_timeout_secs = 10
backend_read_timeout_secs = 30

[api]
enabled = true
bind_address = "127.0.0.1:8989"
cors_enabled = false

[logging]
level = "info"
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to describe your servers and proxy credentials.");
    println!("Then start with: wolfsplit --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfSplitConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Servers: {}", config.servers.len());
            println!(
                "  Masters: {}",
                config
                    .servers
                    .iter()
                    .filter(|s| s.role == wolfsplit::config::ConfiguredRole::Master)
                    .count()
            );
            println!("  Listener: {}", config.proxy.bind_address);
            println!(
                "  Max Slaves/Session: {}",
                config.router.max_slave_count(config.servers.len())
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show router information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfSplitConfig::from_file(&config_path)?;
    let router = &config.router;

    println!("WolfSplit Router Information");
    println!("============================");
    println!();
    println!("Listener:         {}", config.proxy.bind_address);
    println!("HTTP API:         {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });
    println!();
    println!("Routing:");
    println!("  Selection:      {}", router.slave_selection_criteria);
    println!("  Max Slaves:     {}", router.max_slave_count(config.servers.len()));
    println!(
        "  Max Lag:        {}",
        router
            .max_replication_lag()
            .map(|lag| format!("{} s", lag))
            .unwrap_or_else(|| "unlimited".to_string())
    );
    println!("  Master Failure: {}", router.master_failure_mode);
    println!("  Variables In:   {:?}", router.use_sql_variables_in);
    println!(
        "  History Limit:  {}",
        router
            .history_limit()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string())
    );
    println!();
    println!("Servers:");
    for server in &config.servers {
        println!(
            "  {:<14} {:<22} {:?} weight={}",
            server.name,
            server.socket_address(),
            server.role,
            server.weight
        );
    }

    Ok(())
}
