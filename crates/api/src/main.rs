//! `saga-api` server binary.

use saga::EngineConfig;
use saga_api::config::Config;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|err| {
        eprintln!("invalid RUST_LOG '{}': {err}; using info", config.log_level);
        EnvFilter::new("info")
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            result = signal::ctrl_c() => {
                result.expect("failed to install SIGINT handler");
                tracing::info!(signal = "SIGINT", "shutting down");
            }
            _ = terminate.recv() => {
                tracing::info!(signal = "SIGTERM", "shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
        tracing::info!(signal = "ctrl-c", "shutting down");
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let engine_config = EngineConfig::from_env();
    tracing::info!(?engine_config, "engine configuration loaded");
    let state = saga_api::create_default_state(engine_config)
        .await
        .expect("failed to register built-in saga definitions");
    let definitions = state.orchestrator.list_definitions().await.len();

    let app = saga_api::create_app(state, metrics_handle);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {addr}: {err}"));
    tracing::info!(%addr, definitions, "saga API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("saga API stopped");
}
