mod agent;
pub mod audit;
pub mod auth;
mod backends;
mod catalog;
pub mod error;
mod ids;
mod instances;
mod listeners;
mod load_balancers;
pub mod metrics;
mod network;
mod orgs;
pub mod validation;
mod volumes;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Protected API routes
    let api_routes = Router::new()
        // Load balancers
        .route(
            "/loadbalancers",
            get(load_balancers::list_load_balancers).post(load_balancers::create_load_balancer),
        )
        .route(
            "/loadbalancers/:lbid",
            get(load_balancers::get_load_balancer)
                .put(load_balancers::update_load_balancer)
                .delete(load_balancers::delete_load_balancer),
        )
        .route(
            "/loadbalancers/:lbid/floatingips",
            get(load_balancers::list_floating_ips).post(load_balancers::attach_floating_ip),
        )
        .route(
            "/loadbalancers/:lbid/floatingips/:fipid",
            delete(load_balancers::detach_floating_ip),
        )
        // Listeners
        .route(
            "/loadbalancers/:lbid/listeners",
            get(listeners::list_listeners).post(listeners::create_listener),
        )
        .route(
            "/loadbalancers/:lbid/listeners/:lstnid",
            get(listeners::get_listener)
                .put(listeners::update_listener)
                .delete(listeners::delete_listener),
        )
        // Backends
        .route(
            "/loadbalancers/:lbid/listeners/:lstnid/backends",
            get(backends::list_backends).post(backends::create_backend),
        )
        .route(
            "/loadbalancers/:lbid/listeners/:lstnid/backends/:bkid",
            get(backends::get_backend)
                .put(backends::update_backend)
                .delete(backends::delete_backend),
        )
        // Instances
        .route(
            "/instances",
            get(instances::list_instances).post(instances::create_instances),
        )
        .route(
            "/instances/:id",
            get(instances::get_instance)
                .put(instances::update_instance)
                .delete(instances::delete_instance),
        )
        .route("/instances/:id/reinstall", post(instances::reinstall_instance))
        .route("/instances/:id/password", post(instances::set_instance_password))
        .route("/instances/:id/action", post(instances::instance_action))
        // Networking
        .route(
            "/routers",
            get(network::list_routers).post(network::create_router),
        )
        .route("/routers/:id", get(network::get_router))
        .route(
            "/subnets",
            get(network::list_subnets).post(network::create_subnet),
        )
        .route("/subnets/:id", get(network::get_subnet))
        .route("/zones", get(network::list_zones))
        .route("/hypers", get(network::list_hypers))
        // Catalog
        .route("/images", get(catalog::list_images).post(catalog::create_image))
        .route("/flavors", get(catalog::list_flavors).post(catalog::create_flavor))
        // Volumes
        .route("/volumes", get(volumes::list_volumes).post(volumes::create_volume))
        .route(
            "/volumes/:id",
            get(volumes::get_volume)
                .put(volumes::update_volume)
                .delete(volumes::delete_volume),
        )
        .route("/volumes/:id/resize", post(volumes::resize_volume))
        // Organizations
        .route("/orgs", get(orgs::list_orgs).post(orgs::create_org))
        .route(
            "/orgs/:org_id/members",
            get(orgs::list_members).post(orgs::add_member),
        )
        .route("/users", post(orgs::create_user))
        // Audit
        .route("/audit", get(audit::list_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    let agent_routes = Router::new()
        .route("/callback", post(agent::callback))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::agent_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .route("/auth/login", post(auth::login))
        .nest("/api", api_routes)
        .nest("/agent", agent_routes)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "version": env!("CARGO_PKG_VERSION") })),
            )
        }
    }
}
