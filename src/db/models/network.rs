//! Hypervisors, zones and the networking rows load balancers and instances sit on.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Hypervisor status value reported by agents for a host accepting work
pub const HYPER_STATUS_READY: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

/// A hypervisor host, keyed by the id its agent reports (`hostid`)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Hyper {
    pub id: i64,
    pub hostid: i64,
    pub hostname: String,
    pub zone_id: i64,
    pub status: i64,
    pub host_ip: String,
    pub cpu: i64,
    pub total_cpu: i64,
    pub memory: i64,
    pub total_memory: i64,
    pub disk: i64,
    pub total_disk: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Hyper {
    pub fn is_ready(&self) -> bool {
        self.status == HYPER_STATUS_READY
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Router {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub name: String,
    pub zone_id: i64,
    /// Lazily created on the first load balancer behind this router
    pub vrrp_subnet_id: i64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing)]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRouterRequest {
    pub name: String,
    pub zone_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetType {
    Internal,
    Public,
    Vrrp,
}

impl SubnetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetType::Internal => "internal",
            SubnetType::Public => "public",
            SubnetType::Vrrp => "vrrp",
        }
    }
}

impl std::fmt::Display for SubnetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subnet {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub name: String,
    /// Network address with prefix, e.g. `10.0.0.0/24`
    pub network: String,
    pub netmask: String,
    /// Gateway with prefix, empty for VRRP subnets
    pub gateway: String,
    pub vlan: i64,
    pub subnet_type: String,
    pub router_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Subnet {
    pub fn kind(&self) -> SubnetType {
        match self.subnet_type.as_str() {
            "public" => SubnetType::Public,
            "vrrp" => SubnetType::Vrrp,
            _ => SubnetType::Internal,
        }
    }

    /// Gateway without its prefix length
    pub fn gateway_ip(&self) -> &str {
        strip_prefix_len(&self.gateway)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSubnetRequest {
    pub name: String,
    pub cidr: String,
    pub gateway: Option<String>,
    pub vlan: Option<i64>,
    #[serde(rename = "type")]
    pub subnet_type: SubnetType,
    pub router_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Address {
    pub id: i64,
    pub subnet_id: i64,
    /// Host address with prefix, e.g. `10.0.0.5/24`
    pub address: String,
    pub allocated: bool,
    pub interface_id: i64,
}

/// What an interface is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Instance,
    Vrrp,
    Floating,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Instance => "instance",
            InterfaceType::Vrrp => "vrrp",
            InterfaceType::Floating => "floating",
        }
    }
}

pub const VRRP_MASTER: &str = "MASTER";
pub const VRRP_BACKUP: &str = "BACKUP";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Interface {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    /// `eth0` for instances, `MASTER`/`BACKUP` for VRRP pairs
    pub name: String,
    pub mac_addr: String,
    pub if_type: String,
    pub instance_id: i64,
    /// Owning VRRP instance for `vrrp` interfaces
    pub device: i64,
    /// Host id the interface is placed on, -1 until an agent reports it
    pub hyper: i64,
    pub subnet_id: i64,
    pub address: String,
    pub primary_if: bool,
    pub mtu: i64,
    pub created_at: String,
}

impl Interface {
    pub fn is_placed(&self) -> bool {
        self.hyper >= 0
    }

    pub fn ip(&self) -> &str {
        strip_prefix_len(&self.address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VrrpInstance {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub vrrp_subnet_id: i64,
    pub zone_id: i64,
    pub router_id: i64,
    pub created_at: String,
    #[serde(skip_serializing)]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FloatingIp {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub load_balancer_id: i64,
    pub subnet_id: i64,
    pub fip_address: String,
    pub created_at: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AttachFloatingIpRequest {
    /// Public subnet to allocate from; the first public subnet with a free address otherwise
    pub subnet_id: Option<i64>,
    pub address: Option<String>,
}

/// `a.b.c.d/nn` to `a.b.c.d`
pub fn strip_prefix_len(address: &str) -> &str {
    address.split('/').next().unwrap_or(address)
}
