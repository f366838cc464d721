//! Load balancer, listener and backend models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{FloatingIp, Interface};

pub const STATUS_AVAILABLE: &str = "available";
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_DELETED: &str = "deleted";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LoadBalancer {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub name: String,
    pub status: String,
    pub router_id: i64,
    pub vrrp_instance_id: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing)]
    pub deleted_at: Option<String>,
}

impl LoadBalancer {
    pub fn is_available(&self) -> bool {
        self.status == STATUS_AVAILABLE
    }
}

/// Load balancer with the rows hanging off it
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerDetail {
    #[serde(flatten)]
    pub load_balancer: LoadBalancer,
    pub vlan: i64,
    pub vrrp_interfaces: Vec<Interface>,
    pub floating_ips: Vec<FloatingIp>,
    pub listeners: Vec<ListenerResponse>,
}

#[derive(Debug, Deserialize)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub router_id: i64,
    pub zone_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLoadBalancerRequest {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    Http,
    Https,
    Tcp,
}

impl ListenerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerMode::Http => "http",
            ListenerMode::Https => "https",
            ListenerMode::Tcp => "tcp",
        }
    }
}

impl std::str::FromStr for ListenerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ListenerMode::Http),
            "https" => Ok(ListenerMode::Https),
            "tcp" => Ok(ListenerMode::Tcp),
            _ => Err(format!("Unknown listener mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Listener {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub name: String,
    pub status: String,
    pub port: i64,
    pub mode: String,
    pub certificate: String,
    pub key: String,
    pub load_balancer_id: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

/// Response DTO for Listener (the private key never leaves the server)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerResponse {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub name: String,
    pub status: String,
    pub port: i64,
    pub mode: String,
    pub has_certificate: bool,
    pub load_balancer_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Listener> for ListenerResponse {
    fn from(l: Listener) -> Self {
        Self {
            id: l.id,
            uuid: l.uuid,
            owner: l.owner,
            name: l.name,
            status: l.status,
            port: l.port,
            mode: l.mode,
            has_certificate: !l.certificate.is_empty(),
            load_balancer_id: l.load_balancer_id,
            created_at: l.created_at,
            updated_at: l.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateListenerRequest {
    pub name: String,
    pub mode: ListenerMode,
    pub port: i64,
    pub certificate: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateListenerRequest {
    pub name: Option<String>,
    pub mode: Option<ListenerMode>,
    pub port: Option<i64>,
    pub certificate: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Backend {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub name: String,
    pub listener_id: i64,
    pub load_balancer_id: i64,
    /// `host:port` haproxy forwards to
    pub backend_addr: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing)]
    pub deleted_at: Option<String>,
}

/// Backend row as listed, with the owning organization name for admins
#[derive(Debug, Clone, Serialize)]
pub struct BackendResponse {
    #[serde(flatten)]
    pub backend: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBackendRequest {
    pub name: String,
    pub backend_addr: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateBackendRequest {
    pub backend_addr: String,
}
