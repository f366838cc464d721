use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratus::admin::org;
use stratus::api::metrics::init_metrics;
use stratus::cli::{run_command, Cli};
use stratus::config::{Config, LogFormat};
use stratus::dispatch::{create_executor, Dispatcher, HyperExecutor};
use stratus::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.command.is_some() {
        return run_command(&cli).await;
    }

    let config = Config::load(&cli.config)?;
    init_tracing(cli.log_level.as_deref().unwrap_or(&config.logging.level), config.logging.format);

    tracing::info!("Starting stratus v{}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.server.data_dir.display())
    })?;
    let db = stratus::db::init(&config.server.data_dir).await?;

    let admin_org_id = {
        let mut conn = db.acquire().await?;
        org::ensure_admin(
            &mut conn,
            &config.auth.admin_username,
            config.auth.admin_password.as_deref(),
        )
        .await
        .context("Failed to bootstrap the admin organization")?
    };

    let executor = create_executor(&config.dispatch).await;
    tracing::info!(executor = executor.name(), "Dispatch ready");
    let dispatcher = Dispatcher::new(executor, config.dispatch.scripts_dir.clone());

    let mut state = AppState::new(config.clone(), db, dispatcher, admin_org_id);
    if config.metrics.enabled {
        match init_metrics() {
            Ok(handle) => state = state.with_metrics(handle),
            Err(e) => tracing::warn!("Metrics disabled: {:#}", e),
        }
    }
    let state = Arc::new(state);

    let app = stratus::api::create_router(state);

    let api_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind {}", api_addr))?;

    tracing::info!("API server listening on http://{}", api_addr);
    tracing::info!("Admin token: {}", config.auth.admin_token);
    tracing::info!("Agent token: {}", config.auth.agent_token);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
