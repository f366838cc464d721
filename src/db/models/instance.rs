//! Instance, image, flavor and volume models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Interface;

/// Lifecycle states of a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    ShutOff,
    Paused,
    Migrating,
    Reinstalling,
    Resizing,
    Deleting,
    Deleted,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::ShutOff => "shut_off",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Migrating => "migrating",
            InstanceStatus::Reinstalling => "reinstalling",
            InstanceStatus::Resizing => "resizing",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Deleted => "deleted",
            InstanceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "shut_off" => Ok(InstanceStatus::ShutOff),
            "paused" => Ok(InstanceStatus::Paused),
            "migrating" => Ok(InstanceStatus::Migrating),
            "reinstalling" => Ok(InstanceStatus::Reinstalling),
            "resizing" => Ok(InstanceStatus::Resizing),
            "deleting" => Ok(InstanceStatus::Deleting),
            "deleted" => Ok(InstanceStatus::Deleted),
            "error" => Ok(InstanceStatus::Error),
            _ => Err(format!("Unknown instance status: {}", s)),
        }
    }
}

/// Power actions accepted by `action_vm`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Start,
    Stop,
    HardStop,
    Restart,
    HardRestart,
    Pause,
    Resume,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::HardStop => "hard_stop",
            PowerAction::Restart => "restart",
            PowerAction::HardRestart => "hard_restart",
            PowerAction::Pause => "pause",
            PowerAction::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Instance {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub hostname: String,
    pub status: String,
    pub reason: String,
    pub cpu: i64,
    /// MiB
    pub memory: i64,
    /// GiB
    pub disk: i64,
    pub image_id: i64,
    pub flavor_id: i64,
    pub zone_id: i64,
    pub router_id: i64,
    pub hyper: i64,
    pub login_port: i64,
    #[serde(skip_serializing, default)]
    pub userdata: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing)]
    pub deleted_at: Option<String>,
}

impl Instance {
    pub fn status_enum(&self) -> Option<InstanceStatus> {
        self.status.parse().ok()
    }

    pub fn is(&self, status: InstanceStatus) -> bool {
        self.status == status.as_str()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub instance: Instance,
    pub interfaces: Vec<Interface>,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(default = "default_count")]
    pub count: i64,
    pub hostname: String,
    pub image_id: i64,
    pub flavor_id: Option<i64>,
    pub cpu: Option<i64>,
    pub memory: Option<i64>,
    pub disk: Option<i64>,
    pub zone_id: i64,
    pub subnet_id: i64,
    /// Host id to launch the first instance on
    pub hyper_id: Option<i64>,
    pub userdata: Option<String>,
    pub root_passwd: Option<String>,
    pub login_port: Option<i64>,
}

fn default_count() -> i64 {
    1
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateInstanceRequest {
    pub hostname: Option<String>,
    pub flavor_id: Option<i64>,
    pub cpu: Option<i64>,
    pub memory: Option<i64>,
    pub disk: Option<i64>,
    pub power_action: Option<PowerAction>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReinstallInstanceRequest {
    pub image_id: Option<i64>,
    pub flavor_id: Option<i64>,
    pub root_passwd: Option<String>,
    pub login_port: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    #[serde(default = "default_user")]
    pub user: String,
    pub password: String,
}

fn default_user() -> String {
    "root".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PowerActionRequest {
    pub action: PowerAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    /// `linux` or `windows`
    pub os_code: String,
    /// Bytes
    pub size: i64,
    pub status: String,
    pub created_at: String,
}

impl Image {
    pub fn is_windows(&self) -> bool {
        self.os_code == "windows"
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateImageRequest {
    pub name: String,
    #[serde(default = "default_os_code")]
    pub os_code: String,
    pub size: i64,
}

fn default_os_code() -> String {
    "linux".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Flavor {
    pub id: i64,
    pub name: String,
    pub cpu: i64,
    pub memory: i64,
    pub disk: i64,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateFlavorRequest {
    pub name: String,
    pub cpu: i64,
    pub memory: i64,
    pub disk: i64,
}

pub const VOLUME_STATUS_PENDING: &str = "pending";
pub const VOLUME_STATUS_AVAILABLE: &str = "available";
pub const VOLUME_STATUS_ATTACHING: &str = "attaching";
pub const VOLUME_STATUS_ATTACHED: &str = "attached";
pub const VOLUME_STATUS_DETACHING: &str = "detaching";
pub const VOLUME_STATUS_RESIZING: &str = "resizing";
pub const VOLUME_STATUS_REINSTALLING: &str = "reinstalling";
pub const VOLUME_STATUS_DELETING: &str = "deleting";
pub const VOLUME_STATUS_ERROR: &str = "error";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Volume {
    pub id: i64,
    pub uuid: String,
    pub owner: i64,
    pub name: String,
    pub instance_id: i64,
    pub booting: bool,
    pub status: String,
    /// GiB
    pub size: i64,
    /// `<driver>://<location>` once the agent has created it
    pub path: String,
    /// Guest device name while attached, e.g. `vdb`
    pub target: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing)]
    pub deleted_at: Option<String>,
}

impl Volume {
    /// An agent operation is in flight
    pub fn is_busy(&self) -> bool {
        matches!(
            self.status.as_str(),
            VOLUME_STATUS_ATTACHING
                | VOLUME_STATUS_DETACHING
                | VOLUME_STATUS_RESIZING
                | VOLUME_STATUS_REINSTALLING
        )
    }

    pub fn is_attached(&self) -> bool {
        self.status == VOLUME_STATUS_ATTACHED
    }

    pub fn is_error(&self) -> bool {
        self.status == VOLUME_STATUS_ERROR
    }

    /// Location with the `local://` prefix stripped; other drivers keep the full path
    pub fn local_path(&self) -> &str {
        self.path.strip_prefix("local://").unwrap_or(&self.path)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    /// GiB
    pub size: i64,
}

/// `instance_id`: a positive id attaches, `0` detaches, absent leaves the
/// attachment alone
#[derive(Debug, Default, Deserialize)]
pub struct UpdateVolumeRequest {
    pub name: Option<String>,
    pub instance_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ResizeVolumeRequest {
    /// GiB
    pub size: i64,
}
