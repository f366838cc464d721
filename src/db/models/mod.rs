//! Database models split into domain-specific modules.

pub mod audit;
pub mod common;
pub mod instance;
pub mod load_balancer;
pub mod network;
pub mod org;

pub use audit::*;
pub use common::*;
pub use instance::*;
pub use load_balancer::*;
pub use network::*;
pub use org::*;
