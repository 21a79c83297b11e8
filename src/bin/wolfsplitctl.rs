//! WolfSplitCtl - Command line tool for a running WolfSplit router
//!
//! Usage:
//!   wolfsplitctl status                      - Router health
//!   wolfsplitctl servers                     - Server table
//!   wolfsplitctl stats                       - Routing counters
//!   wolfsplitctl set-server db2 --lag 12     - Report monitored server state

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

use wolfsplit::api::{ErrorResponse, HealthResponse};
use wolfsplit::server::{ServerRole, ServerSnapshot, ServerUpdate};

/// WolfSplit Router Control Tool
#[derive(Parser)]
#[command(name = "wolfsplitctl")]
#[command(about = "Control and monitor a WolfSplit router", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfsplit/wolfsplit.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show router health
    Status,
    /// List servers and their state
    Servers,
    /// Show routing statistics
    Stats,
    /// Update the monitored state of a server
    SetServer {
        /// Server name
        name: String,
        /// New role: master, slave, relay or none
        #[arg(long)]
        role: Option<String>,
        /// Mark the server running or down
        #[arg(long)]
        running: Option<bool>,
        /// Put the server in or out of maintenance
        #[arg(long)]
        maintenance: Option<bool>,
        /// Replication lag in seconds, negative for unknown
        #[arg(long, allow_hyphen_values = true)]
        lag: Option<i64>,
        /// Replication depth
        #[arg(long)]
        depth: Option<i32>,
        /// Selection weight
        #[arg(long)]
        weight: Option<u32>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct ServerRow {
    #[serde(flatten)]
    server: ServerSnapshot,
    #[serde(default)]
    router_connections: usize,
}

#[derive(Debug, Deserialize)]
struct StatsApiResponse {
    stats: StatsCounters,
    #[serde(default)]
    master_percent: f64,
    #[serde(default)]
    slave_percent: f64,
    #[serde(default)]
    all_percent: f64,
    #[serde(default)]
    servers: Vec<ServerRow>,
}

#[derive(Debug, Deserialize)]
struct StatsCounters {
    #[serde(default)]
    sessions_total: u64,
    #[serde(default)]
    sessions_current: u64,
    #[serde(default)]
    queries: u64,
    #[serde(default)]
    routed_to_master: u64,
    #[serde(default)]
    routed_to_slave: u64,
    #[serde(default)]
    routed_to_all: u64,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8989".to_string()
}

/// API base URL from the config file, with wildcard binds mapped to localhost
fn endpoint_from_config(path: &PathBuf) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    match addr.strip_prefix("0.0.0.0") {
        Some(port) => format!("http://127.0.0.1{}", port),
        None => format!("http://{}", addr),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));

    let result = match cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Servers => list_servers(&endpoint).await,
        Commands::Stats => show_stats(&endpoint).await,
        Commands::SetServer {
            name,
            role,
            running,
            maintenance,
            lag,
            depth,
            weight,
        } => {
            let role = match role.as_deref().map(parse_role).transpose() {
                Ok(role) => role,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    std::process::exit(1);
                }
            };
            let update = ServerUpdate {
                role,
                running,
                maintenance,
                weight,
                depth,
                replication_lag: lag,
            };
            set_server(&endpoint, &name, &update).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn parse_role(role: &str) -> Result<ServerRole> {
    Ok(match role.to_ascii_lowercase().as_str() {
        "master" => ServerRole::Master,
        "slave" => ServerRole::Slave,
        "relay" => ServerRole::Relay,
        "none" => ServerRole::None,
        other => bail!("unknown role '{}'", other),
    })
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> Result<()> {
    let url = format!("{}/health", endpoint);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    // 503 still carries the health body
    let health: HealthResponse = response.json().await.context("invalid health response")?;

    println!();
    println!("WolfSplit Router Status (wolfsplitctl v{})", env!("CARGO_PKG_VERSION"));
    println!("=========================================");
    println!();
    if health.healthy {
        println!("Health:   \x1b[32mOK\x1b[0m");
    } else {
        println!("Health:   \x1b[31mNO MASTER\x1b[0m");
    }
    println!("Master:   {}", health.master.as_deref().unwrap_or("NONE"));
    println!("Servers:  {} running / {} configured", health.servers_running, health.servers_total);
    println!("Sessions: {}", health.sessions_current);
    println!("Uptime:   {}", format_duration(health.uptime_seconds.max(0) as u64));
    println!();
    Ok(())
}

async fn list_servers(endpoint: &str) -> Result<()> {
    let url = format!("{}/servers", endpoint);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    let servers: Vec<ServerRow> = response.json().await?;
    print_servers(&servers);
    Ok(())
}

fn print_servers(servers: &[ServerRow]) {
    println!();
    println!(
        "{:<14} {:<22} {:<10} {:<12} {:>6} {:>6} {:>7} {:>5}",
        "NAME", "ADDRESS", "ROLE", "STATUS", "WEIGHT", "LAG", "CONNS", "OPS"
    );
    println!("{}", "-".repeat(92));

    for row in servers {
        let server = &row.server;
        // Pad status to fixed width BEFORE adding color codes
        let (status, color) = if server.maintenance {
            ("Maintenance", "33")
        } else if server.running {
            ("Running", "32")
        } else {
            ("Down", "31")
        };
        let status = format!("\x1b[{}m{:<12}\x1b[0m", color, status);

        let lag = server
            .replication_lag
            .map(|lag| lag.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<14} {:<22} {:<10} {} {:>6} {:>6} {:>7} {:>5}",
            server.name,
            server.address,
            server.role.to_string(),
            status,
            server.weight,
            lag,
            row.router_connections,
            server.operations
        );
    }
    println!();
}

async fn show_stats(endpoint: &str) -> Result<()> {
    let url = format!("{}/stats", endpoint);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    let stats: StatsApiResponse = response.json().await?;
    let counters = &stats.stats;

    println!();
    println!("Sessions:  {} current, {} total", counters.sessions_current, counters.sessions_total);
    println!("Queries:   {}", counters.queries);
    println!("  master:  {:>10}  ({:.1}%)", counters.routed_to_master, stats.master_percent);
    println!("  slave:   {:>10}  ({:.1}%)", counters.routed_to_slave, stats.slave_percent);
    println!("  all:     {:>10}  ({:.1}%)", counters.routed_to_all, stats.all_percent);
    print_servers(&stats.servers);
    Ok(())
}

async fn set_server(endpoint: &str, name: &str, update: &ServerUpdate) -> Result<()> {
    let url = format!("{}/servers/{}", endpoint, name);
    let client = reqwest::Client::new();
    let response = client
        .put(&url)
        .json(update)
        .send()
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    if !response.status().is_success() {
        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(error) => bail!("{} ({})", error.error, error.code),
            Err(_) => bail!("API error: {}", status),
        }
    }

    let snapshot: ServerSnapshot = response.json().await?;
    println!(
        "✓ {} role={} running={} maintenance={} lag={}",
        snapshot.name,
        snapshot.role,
        snapshot.running,
        snapshot.maintenance,
        snapshot
            .replication_lag
            .map(|lag| lag.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    Ok(())
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
