// src/main.rs
// Process entry point: load config, run the phased startup registry, serve
// the gateway's axum router. Grounded on the teacher's proxy/server.rs
// `TcpListener::bind` + `axum::serve` shape and mira-chat's `fmt()` +
// `EnvFilter::from_default_env()` logging init.

use std::sync::Arc;

use kumon_receptionist::gateway::{self, ConversationDispatcher};
use kumon_receptionist::state::AppState;
use kumon_receptionist::{metrics, Config};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    metrics::init_metrics();

    let config = Config::from_env();
    let state = AppState::build(config).await?;
    let dispatcher = ConversationDispatcher::new(state.clone());

    let addr = state.config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "receptionist listening");

    let drain_timeout = std::time::Duration::from_secs(state.config.workflow.turn_deadline_secs + 10);
    let app = gateway::router(state, dispatcher.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // `with_graceful_shutdown` only waits on in-flight HTTP responses; the
    // per-conversation mailbox workers run detached from any request and
    // need their own drain before the process exits.
    dispatcher.shutdown(drain_timeout).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight turns");
}
