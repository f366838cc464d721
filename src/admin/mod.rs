//! Service layer behind the HTTP handlers.
//!
//! Every operation receives an [`AdminContext`] (who is calling, how to reach
//! the agents) and a `&mut SqliteConnection`. Handlers open one transaction per
//! request and pass it down, so helpers calling each other all write through
//! the same transaction; it commits once at the top and rolls back when an
//! error drops it.

pub mod backend;
pub mod callbacks;
pub mod catalog;
pub mod error;
pub mod hypers;
pub mod instance;
pub mod listener;
pub mod load_balancer;
pub mod membership;
pub mod network;
pub mod org;
pub mod volume;
pub mod vrrp;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AdminError, AdminResult, ErrorKind};
pub use membership::Membership;

use crate::config::Config;
use crate::dispatch::{Command, Control, Dispatcher};

pub struct AdminContext<'a> {
    pub member: &'a Membership,
    pub dispatcher: &'a Dispatcher,
    pub config: &'a Config,
}

impl<'a> AdminContext<'a> {
    pub fn new(member: &'a Membership, dispatcher: &'a Dispatcher, config: &'a Config) -> Self {
        Self {
            member,
            dispatcher,
            config,
        }
    }

    /// Send a command to the agents, mapping transport failures to
    /// `ExecuteOnHyperFailed`
    pub async fn dispatch(&self, control: Control, command: Command) -> AdminResult<()> {
        self.dispatcher
            .execute(&control, &command)
            .await
            .map_err(|e| AdminError::hyper(format!("{} execution failed", command.script()), e))
    }
}
