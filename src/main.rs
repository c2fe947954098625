use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use sparkvisor::config::Config;
use sparkvisor::dashboard::{create_router, DashboardState};
use sparkvisor::llm::OllamaClient;
use sparkvisor::patch::DiffApplierFactory;
use sparkvisor::project::SessionRegistry;
use sparkvisor::sandbox::DockerProvider;
use sparkvisor::store::JsonStore;
use sparkvisor::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    telemetry::init_tracing("sparkvisor", config.otlp_endpoint.as_deref(), &config.log_filter)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;

    let store = Arc::new(match &config.data_dir {
        Some(dir) => JsonStore::new(dir),
        None => JsonStore::default_store(),
    }
    .context("failed to open data directory")?);
    info!(data_dir = %store.base_dir().display(), "store opened");

    let model = Arc::new(OllamaClient::new(config.ollama_url.clone()));
    let patches = Arc::new(DiffApplierFactory::new(
        model.clone(),
        config.fast_model(),
        config.lint_workdir.clone(),
    ));
    let provider = Arc::new(DockerProvider::new(
        config.docker_port_start,
        config.docker_container_port,
    ));

    let registry = SessionRegistry::new(
        store.clone(),
        store,
        provider,
        model,
        patches,
        config.manager_config(),
    );
    let sweeper = registry.spawn_sweeper(config.sweep_interval(), config.idle_timeout());

    let app = create_router(DashboardState {
        registry: Arc::clone(&registry),
    });
    let listener = tokio::net::TcpListener::bind(config.dashboard_addr)
        .await
        .with_context(|| format!("failed to bind dashboard on {}", config.dashboard_addr))?;
    info!(addr = %config.dashboard_addr, "dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("dashboard server failed")?;

    sweeper.abort();
    registry.shutdown().await;
    telemetry::shutdown_tracing();
    Ok(())
}
