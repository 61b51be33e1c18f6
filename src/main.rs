use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use latent_refiner::{
    config::Settings,
    decoder::{load_decoder, Decoder, SerializedDecoder},
    encode::PngBase64,
    routes::{router, AppState},
    session::{Generator, SessionOptions},
};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let settings = Settings::from_env();
    tracing::info!(?settings, "Loaded settings");

    let decoder: Arc<dyn Decoder> = Arc::new(
        load_decoder(&settings.model_dir)
            .with_context(|| format!("failed to load decoder from {}", settings.model_dir.display()))?,
    );
    let decoder: Arc<dyn Decoder> = if settings.serialize_decode {
        tracing::info!("Serializing decoder access across sessions");
        Arc::new(SerializedDecoder::new(decoder))
    } else {
        decoder
    };

    let state = AppState {
        generator: Generator::new(decoder, Arc::new(PngBase64), SessionOptions::from(&settings)),
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
