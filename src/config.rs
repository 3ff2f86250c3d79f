//! Server configuration: command-line flags, each mirrored by an
//! `MYDICT_TTS_*` environment variable.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;

use crate::{
    embeddings::{MissingEmbeddings, DEFAULT_EMBEDDINGS_FILE},
    speecht5::SpeechT5Settings,
};

/// Default `RUST_LOG` directive when the variable is unset.
pub const DEFAULT_LOG_FILTER: &str = "mydictionary_tts=info,tower_http=info";

#[derive(Parser, Debug, Clone)]
#[command(name = "mydictionary-tts", version, about = "Local text-to-speech server")]
pub struct ServerConfig {
    /// Address to bind to
    #[arg(long, env = "MYDICT_TTS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "MYDICT_TTS_PORT", default_value_t = 5050)]
    pub port: u16,

    /// Model loaded before accepting traffic
    #[arg(long, env = "MYDICT_TTS_DEFAULT_MODEL", default_value = "speecht5")]
    pub default_model: String,

    /// Start without loading any model
    #[arg(long, env = "MYDICT_TTS_NO_PRELOAD", default_value_t = false)]
    pub no_preload: bool,

    /// Speaker embedding table (.npy or .npz, [speakers, 512])
    #[arg(long, env = "MYDICT_TTS_SPEAKER_EMBEDDINGS", default_value = DEFAULT_EMBEDDINGS_FILE)]
    pub speaker_embeddings: PathBuf,

    /// Fail synthesis instead of using a zero voice when the table is missing
    #[arg(long, env = "MYDICT_TTS_STRICT_EMBEDDINGS", default_value_t = false)]
    pub strict_embeddings: bool,

    /// HuggingFace cache directory override
    #[arg(long, env = "MYDICT_TTS_HF_CACHE_DIR")]
    pub hf_cache_dir: Option<PathBuf>,

    /// Use the int8-quantized ONNX graphs
    #[arg(long, env = "MYDICT_TTS_QUANTIZED", default_value_t = false)]
    pub quantized: bool,

    /// Directory for cached audio; caching is off when unset
    #[arg(long, env = "MYDICT_TTS_AUDIO_CACHE_DIR")]
    pub audio_cache_dir: Option<PathBuf>,

    /// Seconds a cached clip stays valid
    #[arg(long, env = "MYDICT_TTS_AUDIO_CACHE_TTL", default_value_t = 3600)]
    pub audio_cache_ttl: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn audio_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.audio_cache_ttl)
    }

    pub fn speecht5_settings(&self) -> SpeechT5Settings {
        SpeechT5Settings {
            embeddings_path: self.speaker_embeddings.clone(),
            on_missing_embeddings: if self.strict_embeddings {
                MissingEmbeddings::Error
            } else {
                MissingEmbeddings::ZeroFill
            },
            hf_cache_dir: self.hf_cache_dir.clone(),
            quantized: self.quantized,
        }
    }
}

/// Install the global fmt subscriber, honouring `RUST_LOG`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::try_parse_from(["mydictionary-tts"]).unwrap();
        assert_eq!(cfg.port, 5050);
        assert_eq!(cfg.default_model, "speecht5");
        assert!(!cfg.no_preload);
        assert_eq!(cfg.socket_addr().unwrap().to_string(), "0.0.0.0:5050");
        assert_eq!(cfg.audio_cache_ttl(), Duration::from_secs(3600));
        assert!(cfg.audio_cache_dir.is_none());

        let settings = cfg.speecht5_settings();
        assert_eq!(settings.on_missing_embeddings, MissingEmbeddings::ZeroFill);
        assert_eq!(settings.embeddings_path, PathBuf::from(DEFAULT_EMBEDDINGS_FILE));
    }

    #[test]
    fn test_flags() {
        let cfg = ServerConfig::try_parse_from([
            "mydictionary-tts",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--strict-embeddings",
            "--quantized",
            "--speaker-embeddings",
            "voices.npz",
        ])
        .unwrap();
        assert_eq!(cfg.socket_addr().unwrap().to_string(), "127.0.0.1:9000");

        let settings = cfg.speecht5_settings();
        assert_eq!(settings.on_missing_embeddings, MissingEmbeddings::Error);
        assert!(settings.quantized);
        assert_eq!(settings.embeddings_path, PathBuf::from("voices.npz"));
    }

    #[test]
    fn test_bad_host() {
        let cfg =
            ServerConfig::try_parse_from(["mydictionary-tts", "--host", "not a host"]).unwrap();
        assert!(cfg.socket_addr().is_err());
    }
}
