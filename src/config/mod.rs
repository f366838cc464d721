use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub instances: InstanceConfig,
    #[serde(default)]
    pub networking: NetworkingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Base URL the CLI client talks to
    #[serde(default = "default_external_url")]
    pub external_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            data_dir: default_data_dir(),
            external_url: default_external_url(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8255
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_external_url() -> String {
    "http://127.0.0.1:8255".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Password for the bootstrap admin user. No user is created when unset.
    pub admin_password: Option<String>,
    /// Bearer token hypervisor agents present on callbacks
    #[serde(default = "default_agent_token")]
    pub agent_token: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
            admin_username: default_admin_username(),
            admin_password: None,
            agent_token: default_agent_token(),
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

fn default_admin_token() -> String {
    // Generate a random token if not provided
    uuid::Uuid::new_v4().to_string()
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_agent_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_session_ttl_hours() -> i64 {
    24 * 7
}

/// How commands reach the hypervisor agents
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_executor")]
    pub executor: ExecutorType,
    /// Program invoked as `<client_path> <control> <command>` by the shell executor
    #[serde(default = "default_client_path")]
    pub client_path: PathBuf,
    /// Broker URL the http executor posts commands to
    pub endpoint: Option<String>,
    #[serde(default = "default_dispatch_timeout")]
    pub timeout_secs: u64,
    /// Directory holding the agent-side scripts, as seen on the hypervisors
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            executor: default_executor(),
            client_path: default_client_path(),
            endpoint: None,
            timeout_secs: default_dispatch_timeout(),
            scripts_dir: default_scripts_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    Shell,
    Http,
    Noop,
}

fn default_executor() -> ExecutorType {
    ExecutorType::Shell
}

fn default_client_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/hyper-dispatch")
}

fn default_dispatch_timeout() -> u64 {
    30
}

fn default_scripts_dir() -> String {
    "/opt/stratus/scripts/backend".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_linux_port")]
    pub default_linux_port: i64,
    #[serde(default = "default_windows_port")]
    pub default_windows_port: i64,
    /// Instances per snapshot bucket handed to launch_vm
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: i64,
    /// Allow setting guest passwords through the agent
    #[serde(default)]
    pub qa_enabled: bool,
    #[serde(default = "default_dns")]
    pub dns: String,
    /// Suffix of the volume scripts, e.g. `create_volume_local`
    #[serde(default = "default_volume_driver")]
    pub volume_driver: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            default_linux_port: default_linux_port(),
            default_windows_port: default_windows_port(),
            snapshot_interval: default_snapshot_interval(),
            qa_enabled: false,
            dns: default_dns(),
            volume_driver: default_volume_driver(),
        }
    }
}

fn default_linux_port() -> i64 {
    22
}

fn default_windows_port() -> i64 {
    3389
}

fn default_snapshot_interval() -> i64 {
    96
}

fn default_dns() -> String {
    "8.8.8.8".to_string()
}

fn default_volume_driver() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkingConfig {
    /// CIDR used for the per-router VRRP subnet
    #[serde(default = "default_vrrp_cidr")]
    pub vrrp_cidr: String,
    /// First VLAN handed out when a subnet is created without one
    #[serde(default = "default_vlan_start")]
    pub vlan_start: i64,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            vrrp_cidr: default_vrrp_cidr(),
            vlan_start: default_vlan_start(),
        }
    }
}

fn default_vrrp_cidr() -> String {
    "192.168.196.0/24".to_string()
}

fn default_vlan_start() -> i64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            dispatch: DispatchConfig::default(),
            instances: InstanceConfig::default(),
            networking: NetworkingConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}
