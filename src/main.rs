//! # Remote Speech Backend - Server Entry Point
//!
//! Listens for recognition clients and runs one session per connection.
//!
//! ## Startup:
//! 1. **Loads configuration** from config.toml and environment variables
//! 2. **Sets up logging** through `tracing`
//! 3. **Binds the listener** and serves sessions until a shutdown signal
//! 4. **Drains** open sessions, then logs the session counters

use anyhow::{Context, Result};
use remote_speech_backend::audio::CodecRegistry;
use remote_speech_backend::config::AppConfig;
use remote_speech_backend::protocol::{serve, ServerContext};
use remote_speech_backend::state::AppState;
use remote_speech_backend::transcription::DiagnosticRecognizerFactory;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting remote-speech-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{} (max {} sessions)",
        config.server.host, config.server.port, config.server.max_connections
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("could not bind {}", bind_addr))?;

    let state = AppState::new(config);
    let codecs = Arc::new(CodecRegistry::new());
    info!("Accepting codecs: {}", codecs.supported().join(", "));
    let context = ServerContext::new(
        state.clone(),
        codecs,
        Arc::new(DiagnosticRecognizerFactory::default()),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    if let Err(e) = serve(listener, context, shutdown).await {
        error!("Server error: {}", e);
    }

    let metrics = state.get_metrics_snapshot();
    info!(
        total = metrics.total_sessions,
        failed = metrics.failed_sessions,
        finals = metrics.final_results_sent,
        audio_bytes = metrics.audio_bytes_received,
        failure_rate = metrics.failure_rate(),
        uptime_secs = state.get_uptime_seconds(),
        "Server stopped gracefully"
    );
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "remote_speech_backend=trace")
/// - If not set, defaults to "remote_speech_backend=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remote_speech_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or Ctrl+C.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }

    info!("Shutdown signal received, draining sessions...");
    shutdown.cancel();
}
