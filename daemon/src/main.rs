mod control;

use std::path::PathBuf;
use std::sync::Arc;

use platewatch_common::config::Config;
use platewatch_pipeline::Orchestrator;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        config = %config_path.display(),
        data_path = %config.data_path.display(),
        recognition_url = config.recognition.url,
        sources = config.sources.len(),
        filters = config.filters.len(),
        recorders = config.recorders.len(),
        "starting platewatch"
    );

    if let Err(e) = std::fs::create_dir_all(&config.data_path) {
        error!(path = %config.data_path.display(), error = %e, "failed to create data directory");
        std::process::exit(1);
    }

    let orchestrator = match Orchestrator::from_config(&config).await {
        Ok(o) => Arc::new(o),
        Err(e) => {
            error!(error = %e, "failed to build pipeline");
            std::process::exit(1);
        }
    };

    if config.control.enable {
        let addr = format!("0.0.0.0:{}", config.control.port);
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
            eprintln!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        });
        info!(addr, "control API listening");
        let app = control::router(Arc::clone(&orchestrator));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "control API stopped");
            }
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => error!(error = %e, "failed to listen for interrupt"),
    }
    orchestrator.shutdown().await;
}
