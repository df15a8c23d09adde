//! Funding-Rate Arbitrage Engine — process entrypoint.
//!
//! Wires the `Runtime` facade (every process-wide singleton named in
//! spec.md §9) to the background workers of spec.md §5 and the thin
//! `axum` HTTP collaborator of spec.md §6, then drives graceful shutdown
//! on SIGINT/SIGTERM.

use std::net::SocketAddr;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use funding_arb_engine::config::Config;
use funding_arb_engine::runtime::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("funding-rate arbitrage engine starting");

    let config = Config::from_env().context("failed to load configuration")?;
    let port = config.http_port;

    // `Runtime::init` is the only place every process-wide singleton is
    // constructed (spec.md §9: "Instantiate in a Runtime.init() sequence").
    // A failure here (e.g. a missing encryption key) is FATAL per the §7
    // taxonomy and aborts startup rather than limping along.
    let runtime = Runtime::init(config).context("failed to initialize runtime")?;
    info!("runtime initialized: store opened, exchange adapters registered, caches warm");

    let handles = runtime.spawn_background_tasks();
    info!(
        workers = handles.len(),
        "background workers spawned: per-venue WS fan-in, detection cycle, conditional-order monitor"
    );

    let app = funding_arb_engine::api::http::router(runtime.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!(%addr, "HTTP collaborator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("shutdown signal received, draining background workers");
    runtime.shutdown(handles).await;
    info!("shutdown complete");

    Ok(())
}

/// Waits for either Ctrl+C or, on Unix, SIGTERM — whichever arrives first —
/// so `axum::serve` begins its graceful-shutdown drain (spec.md §5: "On
/// shutdown, workers are sent a cancel signal ... exit within 5s").
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funding_arb_engine=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
