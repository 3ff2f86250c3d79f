//! `mydictionary-tts`: local TTS server for the MyDictionary extension.
//!
//! Usage:
//!   mydictionary-tts --port 5050
//!   MYDICT_TTS_SPEAKER_EMBEDDINGS=voices.npy mydictionary-tts --quantized

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};

use mydictionary_tts::{
    cache::AudioCache,
    config::{init_tracing, ServerConfig},
    server::{self, AppState},
    ModelManager, ModelRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "starting TTS server");

    let addr = config.socket_addr()?;
    let registry = ModelRegistry::builtin(config.speecht5_settings());
    let mut state = AppState::new(ModelManager::new(registry));

    if let Some(dir) = &config.audio_cache_dir {
        let cache = AudioCache::new(dir, config.audio_cache_ttl())?;
        if let Err(e) = cache.cleanup() {
            warn!(error = %format!("{e:#}"), "audio cache cleanup failed");
        }
        state = state.with_cache(cache);
    }

    if config.no_preload {
        info!("preload disabled, starting without an active model");
    } else {
        info!(model = %config.default_model, "preloading default model");
        match state.load_model(config.default_model.clone()).await {
            Ok(_) => info!(model = %config.default_model, "default model ready"),
            Err(e) => error!(
                model = %config.default_model,
                error = %e,
                "default model failed to load; synthesis is unavailable until a model is loaded"
            ),
        }
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("health check: http://{addr}/health");
    info!("synthesis:    POST http://{addr}/synthesize");

    server::serve(listener, state, shutdown_signal()).await
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
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
    info!("shutdown signal received");
}
