//! Command line for stratus.
//!
//! Without a subcommand the binary runs the API server. The subcommands talk
//! to a running server over HTTP:
//! - `status` - Server health and version
//! - `lb list` / `lb show <lb>` - Load balancers
//! - `instances list` / `instances show <id>` / `instances action <id> <action>`
//! - `hypers` - Hypervisor capacity (admin token)
//! - `config check` - Validate configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::auth::ORG_HEADER;
use crate::db::{Hyper, Instance, ListResponse, LoadBalancer};

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "stratus")]
#[command(author, version, about = "Cloud admin API for load balancers and instances", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "STRATUS_CONFIG", default_value = "stratus.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// API URL to connect to (defaults to server.external_url)
    #[arg(long, env = "STRATUS_API_URL")]
    pub api_url: Option<String>,

    /// Authentication token (admin token or session token)
    #[arg(long, env = "STRATUS_TOKEN")]
    pub token: Option<String>,

    /// Organization to act in
    #[arg(long, env = "STRATUS_ORG")]
    pub org: Option<String>,

    /// Subcommand to run (if none, starts the server)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show server status
    Status,

    /// Load balancer commands
    #[command(subcommand)]
    Lb(LbCommands),

    /// Instance commands
    #[command(subcommand)]
    Instances(InstanceCommands),

    /// List hypervisors
    Hypers,

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum LbCommands {
    /// List load balancers
    List {
        /// Substring filter on the name
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Show a load balancer with its listeners
    Show {
        /// Load balancer ID or UUID
        lb: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum InstanceCommands {
    /// List instances
    List {
        /// Substring filter on the hostname
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Show an instance with its interfaces and volumes
    Show {
        /// Instance ID or UUID
        id: String,
    },
    /// Send a power action (start, stop, hard_stop, restart, hard_restart, pause, resume)
    Action { id: String, action: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

/// Error envelope returned by the API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    error_code: Option<u32>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Health {
    status: String,
    version: String,
}

/// Thin HTTP client bound to one server and credential
struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    fn new(cli: &Cli) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = &cli.token {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", token)
                    .parse()
                    .context("Invalid token format")?,
            );
        }
        if let Some(org) = &cli.org {
            let name = reqwest::header::HeaderName::from_bytes(ORG_HEADER.as_bytes())
                .context("Invalid organization header")?;
            headers.insert(name, org.parse().context("Invalid organization name")?);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url(cli)?.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .context("Failed to connect to server. Is stratus running?")?;
        decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .context("Failed to connect to server. Is stratus running?")?;
        decode(response).await
    }
}

fn base_url(cli: &Cli) -> Result<String> {
    if let Some(url) = &cli.api_url {
        return Ok(url.clone());
    }
    let config = crate::config::Config::load(&cli.config)?;
    Ok(config.server.external_url)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("Failed to parse response");
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        anyhow::bail!("Authentication required. Use --token or set STRATUS_TOKEN.");
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => anyhow::bail!(
            "{} ({}{}): {}",
            status,
            err.error.code,
            err.error
                .error_code
                .map(|c| format!(" {}", c))
                .unwrap_or_default(),
            err.error.message
        ),
        Err(_) => anyhow::bail!("Server returned error {}: {}", status, body),
    }
}

fn list_path(collection: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?q={}", collection, q),
        _ => collection.to_string(),
    }
}

/// Run a CLI command
pub async fn run_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Some(Commands::Status) => cmd_status(cli).await,
        Some(Commands::Lb(LbCommands::List { query })) => cmd_lb_list(cli, query.as_deref()).await,
        Some(Commands::Lb(LbCommands::Show { lb })) => cmd_lb_show(cli, lb).await,
        Some(Commands::Instances(InstanceCommands::List { query })) => {
            cmd_instances_list(cli, query.as_deref()).await
        }
        Some(Commands::Instances(InstanceCommands::Show { id })) => {
            cmd_instance_show(cli, id).await
        }
        Some(Commands::Instances(InstanceCommands::Action { id, action })) => {
            cmd_instance_action(cli, id, action).await
        }
        Some(Commands::Hypers) => cmd_hypers(cli).await,
        Some(Commands::Config(ConfigCommands::Check)) => cmd_config_check(cli),
        // No subcommand means start the server - handled in main.rs
        None => Ok(()),
    }
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let api = ApiClient::new(cli)?;
    println!("Connecting to {}...", api.base_url);

    let health: Health = api.get("/health").await?;
    let icon = if health.status == "ok" { "[OK]" } else { "[!!]" };

    println!();
    println!("=== Stratus Server Status ===");
    println!();
    println!("Version:    v{}", health.version);
    println!("Status:     {} {}", icon, health.status);

    if cli.token.is_some() {
        let lbs: ListResponse<LoadBalancer> = api.get("/api/loadbalancers?limit=1").await?;
        let instances: ListResponse<Instance> = api.get("/api/instances?limit=1").await?;
        println!();
        println!("Resources:");
        println!("  Load balancers: {}", lbs.total);
        println!("  Instances:      {}", instances.total);
    }

    println!();
    Ok(())
}

async fn cmd_lb_list(cli: &Cli, query: Option<&str>) -> Result<()> {
    let api = ApiClient::new(cli)?;
    let lbs: ListResponse<LoadBalancer> =
        api.get(&list_path("/api/loadbalancers", query)).await?;

    if lbs.items.is_empty() {
        println!("No load balancers found.");
        return Ok(());
    }

    println!();
    println!(
        "{:<6}  {:<36}  {:<24}  {:<10}  {:<8}",
        "ID", "UUID", "NAME", "STATUS", "ROUTER"
    );
    println!("{}", "-".repeat(92));
    for lb in &lbs.items {
        println!(
            "{:<6}  {:<36}  {:<24}  {:<10}  {:<8}",
            lb.id,
            lb.uuid,
            truncate(&lb.name, 24),
            lb.status,
            lb.router_id
        );
    }
    println!();
    println!("{} of {} shown", lbs.items.len(), lbs.total);
    Ok(())
}

async fn cmd_lb_show(cli: &Cli, lb: &str) -> Result<()> {
    let api = ApiClient::new(cli)?;
    let detail: serde_json::Value = api.get(&format!("/api/loadbalancers/{}", lb)).await?;

    println!();
    println!("=== Load Balancer: {} ===", detail["name"].as_str().unwrap_or("-"));
    println!();
    println!("ID:        {}", detail["id"]);
    println!("UUID:      {}", detail["uuid"].as_str().unwrap_or("-"));
    println!("Status:    {}", detail["status"].as_str().unwrap_or("-"));
    println!("VLAN:      {}", detail["vlan"]);

    if let Some(ifaces) = detail["vrrp_interfaces"].as_array() {
        println!();
        println!("VRRP:");
        for iface in ifaces {
            println!(
                "  {:<8} {:<20} hyper {}",
                iface["name"].as_str().unwrap_or("-"),
                iface["address"].as_str().unwrap_or("-"),
                iface["hyper"]
            );
        }
    }
    if let Some(fips) = detail["floating_ips"].as_array() {
        if !fips.is_empty() {
            println!();
            println!("Floating IPs:");
            for fip in fips {
                println!("  {}", fip["fip_address"].as_str().unwrap_or("-"));
            }
        }
    }
    if let Some(listeners) = detail["listeners"].as_array() {
        println!();
        println!("Listeners:");
        if listeners.is_empty() {
            println!("  (none)");
        }
        for l in listeners {
            println!(
                "  {:<6} {:<20} {:<6} :{}",
                l["id"],
                l["name"].as_str().unwrap_or("-"),
                l["mode"].as_str().unwrap_or("-"),
                l["port"]
            );
        }
    }
    println!();
    Ok(())
}

async fn cmd_instances_list(cli: &Cli, query: Option<&str>) -> Result<()> {
    let api = ApiClient::new(cli)?;
    let instances: ListResponse<Instance> = api.get(&list_path("/api/instances", query)).await?;

    if instances.items.is_empty() {
        println!("No instances found.");
        return Ok(());
    }

    println!();
    println!(
        "{:<6}  {:<24}  {:<10}  {:>4}  {:>8}  {:>6}  {:<6}",
        "ID", "HOSTNAME", "STATUS", "CPU", "MEMORY", "DISK", "HYPER"
    );
    println!("{}", "-".repeat(80));
    for inst in &instances.items {
        println!(
            "{:<6}  {:<24}  {:<10}  {:>4}  {:>8}  {:>6}  {:<6}",
            inst.id,
            truncate(&inst.hostname, 24),
            inst.status,
            inst.cpu,
            format!("{}M", inst.memory),
            format!("{}G", inst.disk),
            if inst.hyper >= 0 {
                inst.hyper.to_string()
            } else {
                "-".to_string()
            }
        );
    }
    println!();
    println!("{} of {} shown", instances.items.len(), instances.total);
    Ok(())
}

async fn cmd_instance_show(cli: &Cli, id: &str) -> Result<()> {
    let api = ApiClient::new(cli)?;
    let detail: serde_json::Value = api.get(&format!("/api/instances/{}", id)).await?;
    let text = |key: &str| detail[key].as_str().unwrap_or("-").to_string();

    println!();
    println!("=== Instance: {} ===", text("hostname"));
    println!();
    println!("ID:          {}", detail["id"]);
    println!("UUID:        {}", text("uuid"));
    println!("Status:      {}", text("status"));
    if let Some(reason) = detail["reason"].as_str().filter(|r| !r.is_empty()) {
        println!("Reason:      {}", reason);
    }
    println!(
        "Size:        {} vCPU, {} MiB, {} GiB",
        detail["cpu"], detail["memory"], detail["disk"]
    );
    println!("Hyper:       {}", detail["hyper"]);
    println!("Login port:  {}", detail["login_port"]);

    println!();
    println!("Interfaces:");
    for iface in detail["interfaces"].as_array().into_iter().flatten() {
        println!(
            "  {:<8} {:<20} {}",
            iface["name"].as_str().unwrap_or("-"),
            iface["address"].as_str().unwrap_or("-"),
            iface["mac_addr"].as_str().unwrap_or("-")
        );
    }
    println!();
    println!("Volumes:");
    for vol in detail["volumes"].as_array().into_iter().flatten() {
        let boot = if vol["booting"].as_bool().unwrap_or(false) { " (boot)" } else { "" };
        println!(
            "  {:<32} {:>4} GiB  {}{}",
            vol["name"].as_str().unwrap_or("-"),
            vol["size"],
            vol["status"].as_str().unwrap_or("-"),
            boot
        );
    }
    println!();
    Ok(())
}

async fn cmd_instance_action(cli: &Cli, id: &str, action: &str) -> Result<()> {
    let api = ApiClient::new(cli)?;
    let inst: Instance = api
        .post(
            &format!("/api/instances/{}/action", id),
            json!({ "action": action }),
        )
        .await?;
    println!("Sent {} to instance {} ({})", action, inst.id, inst.hostname);
    Ok(())
}

async fn cmd_hypers(cli: &Cli) -> Result<()> {
    let api = ApiClient::new(cli)?;
    let hypers: Vec<Hyper> = api.get("/api/hypers").await?;

    if hypers.is_empty() {
        println!("No hypervisors have reported yet.");
        return Ok(());
    }

    println!();
    println!(
        "{:<6}  {:<20}  {:<16}  {:<6}  {:>9}  {:>21}  {:>21}",
        "HOST", "HOSTNAME", "ADDRESS", "READY", "CPU", "MEMORY", "DISK"
    );
    println!("{}", "-".repeat(112));
    for h in &hypers {
        println!(
            "{:<6}  {:<20}  {:<16}  {:<6}  {:>9}  {:>21}  {:>21}",
            h.hostid,
            truncate(&h.hostname, 20),
            h.host_ip,
            if h.is_ready() { "yes" } else { "no" },
            format!("{}/{}", h.cpu, h.total_cpu),
            format!("{}/{}", format_kib(h.memory), format_kib(h.total_memory)),
            format!("{}/{}", format_kib(h.disk), format_kib(h.total_disk)),
        );
    }
    println!();
    Ok(())
}

fn cmd_config_check(cli: &Cli) -> Result<()> {
    use crate::config::{Config, ExecutorType};

    let config_path = &cli.config;

    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!("[!!] Configuration file not found: {}", config_path.display());
        println!();
        println!("A default configuration will be used when starting the server.");
        return Ok(());
    }

    match Config::load(config_path) {
        Ok(config) => {
            println!("[OK] Configuration file is valid!");
            println!();
            println!("Server:");
            println!("  Host:         {}", config.server.host);
            println!("  API Port:     {}", config.server.api_port);
            println!("  Data Dir:     {}", config.server.data_dir.display());
            println!();
            println!("Dispatch:");
            println!("  Executor:     {:?}", config.dispatch.executor);
            println!("  Scripts:      {}", config.dispatch.scripts_dir);
            println!("  Timeout:      {}s", config.dispatch.timeout_secs);
            println!();
            println!("Networking:");
            println!("  VRRP CIDR:    {}", config.networking.vrrp_cidr);
            println!();

            let mut warnings = Vec::new();
            if config.auth.admin_password.is_none() {
                warnings.push("auth.admin_password is not set, no admin user will be bootstrapped");
            }
            if config.dispatch.executor == ExecutorType::Http && config.dispatch.endpoint.is_none() {
                warnings.push("dispatch.executor is http but dispatch.endpoint is not set");
            }
            if config.dispatch.executor == ExecutorType::Noop {
                warnings.push("dispatch.executor is noop, hypervisor commands will be dropped");
            }

            if !warnings.is_empty() {
                println!("Warnings:");
                for warning in warnings {
                    println!("  [!] {}", warning);
                }
                println!();
            }
            Ok(())
        }
        Err(e) => {
            println!("[!!] Configuration file is invalid!");
            println!();
            println!("Error: {:#}", e);
            anyhow::bail!("Invalid configuration file");
        }
    }
}

/// Format a KiB quantity as reported by agents
fn format_kib(kib: i64) -> String {
    const MB: i64 = 1024;
    const GB: i64 = MB * 1024;
    const TB: i64 = GB * 1024;

    if kib >= TB {
        format!("{:.1}T", kib as f64 / TB as f64)
    } else if kib >= GB {
        format!("{:.1}G", kib as f64 / GB as f64)
    } else if kib >= MB {
        format!("{:.1}M", kib as f64 / MB as f64)
    } else {
        format!("{}K", kib)
    }
}

/// Truncate a string to max length with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
