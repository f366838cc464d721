//! Prometheus metrics endpoint and HTTP request tracking middleware.
//!
//! This module provides:
//! - A `/metrics` endpoint that returns Prometheus-formatted metrics
//! - Middleware for tracking HTTP request counts and durations
//! - A counter for commands dispatched to the hypervisor agents

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const HYPER_COMMANDS_TOTAL: &str = "hyper_commands_total";
pub const LOAD_BALANCERS_TOTAL: &str = "load_balancers_total";
pub const INSTANCES_TOTAL: &str = "instances_total";

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Call once during startup.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        HYPER_COMMANDS_TOTAL,
        "Commands dispatched to hypervisor agents by script and result"
    );
    describe_gauge!(LOAD_BALANCERS_TOTAL, "Number of live load balancers");
    describe_gauge!(INSTANCES_TOTAL, "Number of live instances by status");

    Ok(handle)
}

/// GET /metrics
///
/// This endpoint is accessible without authentication.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_gauge_metrics(&state).await;

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics not initialized".to_string(),
        ),
    }
}

async fn update_gauge_metrics(state: &AppState) {
    if let Ok(count) = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM load_balancers WHERE deleted_at IS NULL",
    )
    .fetch_one(&state.db)
    .await
    {
        gauge!(LOAD_BALANCERS_TOTAL).set(count as f64);
    }

    match sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM instances WHERE deleted_at IS NULL GROUP BY status",
    )
    .fetch_all(&state.db)
    .await
    {
        Ok(rows) => {
            for (status, count) in rows {
                gauge!(INSTANCES_TOTAL, "status" => status).set(count as f64);
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to count instances for metrics"),
    }
}

/// Middleware to track HTTP request metrics.
///
/// Records:
/// - `http_requests_total` counter with method, path, and status labels
/// - `http_request_duration_seconds` histogram with method and path labels
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Matched path keeps ids out of the label set
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Record one dispatched hyper command
pub fn record_hyper_command(script: &str, ok: bool) {
    let result = if ok { "success" } else { "failed" };
    counter!(HYPER_COMMANDS_TOTAL, "script" => script.to_string(), "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(HTTP_REQUESTS_TOTAL.ends_with("_total"));
        assert!(HYPER_COMMANDS_TOTAL.ends_with("_total"));
        assert!(INSTANCES_TOTAL.ends_with("_total"));
        assert!(HTTP_REQUEST_DURATION_SECONDS.ends_with("_seconds"));
    }

    #[test]
    fn test_record_without_recorder_is_a_noop() {
        record_hyper_command("launch_vm", true);
        record_hyper_command("launch_vm", false);
    }
}
