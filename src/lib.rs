pub mod admin;
pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod dispatch;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::admin::{AdminContext, Membership};
use crate::dispatch::Dispatcher;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub dispatcher: Dispatcher,
    /// Id of the `admin` organization, used for the system membership
    pub admin_org_id: i64,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Config, db: DbPool, dispatcher: Dispatcher, admin_org_id: i64) -> Self {
        Self {
            config,
            db,
            dispatcher,
            admin_org_id,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn system_member(&self) -> Membership {
        Membership::system(self.admin_org_id)
    }

    pub fn cx<'a>(&'a self, member: &'a Membership) -> AdminContext<'a> {
        AdminContext::new(member, &self.dispatcher, &self.config)
    }
}
