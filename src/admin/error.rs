//! Application error carrying an error-kind code.

use serde::Serialize;
use std::fmt;

/// Error kinds with their stable numeric codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unknown,
    InsufficientResource,
    ResourceNotFound,
    InvalidParameter,
    PermissionDenied,
    ExecuteOnHyperFailed,
    OwnerNotFound,
    NoQualifiedHypervisor,
    JsonMarshalFailed,
    DatabaseError,
    SqlSyntaxError,

    InstanceNotFound,
    InstanceCreateFailed,
    InstanceUpdateFailed,
    InstanceDeleteFailed,
    InstanceInvalidState,
    InstanceInvalidConfig,
    InstancePowerActionFailed,

    VolumeNotFound,
    VolumeCreateFailed,
    VolumeUpdateFailed,
    VolumeDeleteFailed,
    VolumeAttachFailed,
    VolumeDetachFailed,
    VolumeInvalidState,
    VolumeInvalidSize,
    VolumeIsInUse,
    BootVolumeCannotDetach,
    VolumeIsBusy,
    ImageNotFound,
    ImageNotAvailable,
    FlavorNotFound,

    SubnetNotFound,
    AddressExhausted,
    RouterNotFound,
    ZoneNotFound,
    HyperNotFound,

    LoadBalancerNotFound,
    LoadBalancerCreateFailed,
    LoadBalancerUpdateFailed,
    LoadBalancerDeleteFailed,
    LoadBalancerUnavailable,
    ListenerNotFound,
    ListenerCreateFailed,
    ListenerUpdateFailed,
    ListenerDeleteFailed,
    BackendNotFound,
    BackendCreateFailed,
    BackendUpdateFailed,
    BackendDeleteFailed,
    VrrpInstanceCreateFailed,
    FloatingIpNotFound,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::Unknown => 100000,
            ErrorKind::InsufficientResource => 100001,
            ErrorKind::ResourceNotFound => 100002,
            ErrorKind::InvalidParameter => 100003,
            ErrorKind::PermissionDenied => 100004,
            ErrorKind::ExecuteOnHyperFailed => 100005,
            ErrorKind::OwnerNotFound => 100006,
            ErrorKind::NoQualifiedHypervisor => 100007,
            ErrorKind::JsonMarshalFailed => 100009,
            ErrorKind::DatabaseError => 100100,
            ErrorKind::SqlSyntaxError => 100101,

            ErrorKind::InstanceNotFound => 111001,
            ErrorKind::InstanceCreateFailed => 111002,
            ErrorKind::InstanceUpdateFailed => 111003,
            ErrorKind::InstanceDeleteFailed => 111004,
            ErrorKind::InstanceInvalidState => 111005,
            ErrorKind::InstanceInvalidConfig => 111007,
            ErrorKind::InstancePowerActionFailed => 111008,

            ErrorKind::VolumeNotFound => 121001,
            ErrorKind::VolumeCreateFailed => 121002,
            ErrorKind::VolumeUpdateFailed => 121003,
            ErrorKind::VolumeDeleteFailed => 121004,
            ErrorKind::VolumeAttachFailed => 121005,
            ErrorKind::VolumeDetachFailed => 121006,
            ErrorKind::VolumeInvalidState => 121007,
            ErrorKind::VolumeInvalidSize => 121008,
            ErrorKind::VolumeIsInUse => 121012,
            ErrorKind::BootVolumeCannotDetach => 121013,
            ErrorKind::VolumeIsBusy => 121014,
            ErrorKind::ImageNotFound => 131001,
            ErrorKind::ImageNotAvailable => 131002,
            ErrorKind::FlavorNotFound => 141001,

            ErrorKind::SubnetNotFound => 151001,
            ErrorKind::AddressExhausted => 151002,
            ErrorKind::RouterNotFound => 152001,
            ErrorKind::ZoneNotFound => 153001,
            ErrorKind::HyperNotFound => 154001,

            ErrorKind::LoadBalancerNotFound => 161001,
            ErrorKind::LoadBalancerCreateFailed => 161002,
            ErrorKind::LoadBalancerUpdateFailed => 161003,
            ErrorKind::LoadBalancerDeleteFailed => 161004,
            ErrorKind::LoadBalancerUnavailable => 161005,
            ErrorKind::ListenerNotFound => 162001,
            ErrorKind::ListenerCreateFailed => 162002,
            ErrorKind::ListenerUpdateFailed => 162003,
            ErrorKind::ListenerDeleteFailed => 162004,
            ErrorKind::BackendNotFound => 163001,
            ErrorKind::BackendCreateFailed => 163002,
            ErrorKind::BackendUpdateFailed => 163003,
            ErrorKind::BackendDeleteFailed => 163004,
            ErrorKind::VrrpInstanceCreateFailed => 164002,
            ErrorKind::FloatingIpNotFound => 165001,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ErrorKind::ResourceNotFound
                | ErrorKind::OwnerNotFound
                | ErrorKind::InstanceNotFound
                | ErrorKind::VolumeNotFound
                | ErrorKind::ImageNotFound
                | ErrorKind::FlavorNotFound
                | ErrorKind::SubnetNotFound
                | ErrorKind::RouterNotFound
                | ErrorKind::ZoneNotFound
                | ErrorKind::HyperNotFound
                | ErrorKind::LoadBalancerNotFound
                | ErrorKind::ListenerNotFound
                | ErrorKind::BackendNotFound
                | ErrorKind::FloatingIpNotFound
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned by every admin operation
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AdminError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    source: Option<BoxError>,
}

pub type AdminResult<T> = Result<T, AdminError>;

impl AdminError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, err: impl Into<BoxError>) -> Self {
        self.source = Some(err.into());
        self
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    pub fn not_found(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Failed remote dispatch
    pub fn hyper(message: impl Into<String>, err: anyhow::Error) -> Self {
        Self::new(ErrorKind::ExecuteOnHyperFailed, message).with_source(err)
    }

    /// Re-tag a lower-level failure under an operation-specific kind,
    /// keeping not-found and permission errors as they are.
    pub fn context(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        if self.kind.is_not_found()
            || matches!(
                self.kind,
                ErrorKind::PermissionDenied | ErrorKind::InvalidParameter
            )
        {
            return self;
        }
        AdminError::new(kind, message).with_source(self)
    }
}

impl From<sqlx::Error> for AdminError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => {
                AdminError::new(ErrorKind::ResourceNotFound, "Resource not found").with_source(err)
            }
            sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint failed") => {
                AdminError::invalid("A resource with this name already exists").with_source(err)
            }
            _ => AdminError::new(ErrorKind::DatabaseError, "A database error occurred").with_source(err),
        }
    }
}

/// Extension for turning `Option` lookups into typed not-found errors
pub trait OptionExt<T> {
    fn or_not_found(self, kind: ErrorKind, message: impl Into<String>) -> AdminResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_not_found(self, kind: ErrorKind, message: impl Into<String>) -> AdminResult<T> {
        self.ok_or_else(|| AdminError::not_found(kind, message))
    }
}
