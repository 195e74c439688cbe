//! Entry point for the `swerex-remote` runtime server.
//!
//! Deployments copy this binary into the target environment and run it with
//! `--port 8000 --auth-token <token>`; the orchestrator then talks to it
//! through `RemoteRuntime`. Logs go to stderr.

use anyhow::Result;
use clap::Parser;
use swerex::server::{AppState, build_router};
use tracing_subscriber::{self, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "swerex-remote", version, about = "Runtime server for swerex")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to serve on.
    #[arg(long, default_value_t = 8000)]
    port: u16,
    /// Reject requests whose X-API-Key header does not carry this token.
    #[arg(long)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    if args.auth_token.is_none() {
        tracing::warn!("no auth token configured, accepting unauthenticated requests");
    }

    let state = AppState::new(args.auth_token);
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    tracing::info!("swerex-remote v{} listening on {}", env!("CARGO_PKG_VERSION"), listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shells hold PTYs open; close them before exiting.
    use swerex::runtime::Runtime;
    let _ = state.runtime.close().await;
    tracing::info!("swerex-remote shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received terminate signal"),
    }
}
