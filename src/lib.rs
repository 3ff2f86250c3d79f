//! # mydictionary-tts
//!
//! Local text-to-speech service for the MyDictionary browser extension: a
//! small registry of TTS models, a manager that loads and selects them, a
//! dispatcher that turns text into samples with the active model, and an
//! HTTP surface that hands the audio back as a file.
//!
//! ## Quick start (library)
//!
//! ```no_run
//! use mydictionary_tts::{
//!     audio::{encode, AudioFormat},
//!     dispatch, ModelManager, ModelRegistry, SpeechT5Settings, SynthesisOptions,
//! };
//!
//! let registry = ModelRegistry::builtin(SpeechT5Settings::default());
//! let mut manager = ModelManager::new(registry);
//! manager.load("speecht5").unwrap();
//!
//! let options = SynthesisOptions::default();
//! let audio = dispatch::synthesize(&manager, "Hello from Rust!", &options).unwrap();
//! let wav = encode(&audio.samples, audio.sample_rate, AudioFormat::Wav).unwrap();
//! std::fs::write("hello.wav", wav).unwrap();
//! ```
//!
//! ## HTTP routes
//! | Route                     | Method | Result                                          |
//! |---------------------------|--------|-------------------------------------------------|
//! | `/`                       | GET    | service info, active model, registry ids        |
//! | `/models`                 | GET    | every entry with `loaded` / `current` flags     |
//! | `/models/{id}/load`       | POST   | load + select a model                           |
//! | `/synthesize`             | POST   | `{text, speaker_id?, format?}` → audio file     |
//! | `/audio/{id}.{ext}`       | GET    | a clip from the audio cache (`X-Audio-Id`)      |
//! | `/health`                 | GET    | device, loaded count, active model              |
//!
//! ## SpeechT5 pipeline
//! 1. **Chunking**: sentence chunks of at most 500 characters.
//! 2. **Tokenisation**: SentencePiece character vocabulary.
//! 3. **Encoder**: ONNX, text ids → hidden states.
//! 4. **Decoder**: merged ONNX decoder with KV cache, mel frames until the
//!    stop token fires.
//! 5. **Vocoder**: HiFi-GAN, mel spectrogram → 16 kHz waveform.

pub mod audio;
pub mod cache;
pub mod dispatch;
pub mod download;
pub mod embeddings;
pub mod error;
pub mod manager;
pub mod npz;
pub mod registry;
pub mod speecht5;
pub mod tokenize;

#[cfg(feature = "server")]
pub mod config;
#[cfg(feature = "server")]
pub mod server;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use audio::AudioFormat;
pub use dispatch::{Audio, SynthesisOptions};
pub use error::{Result, TtsError};
pub use manager::{LoadOutcome, ModelManager};
pub use registry::{LoadedModel, ModelBackend, ModelDescriptor, ModelRegistry};
pub use speecht5::SpeechT5Settings;
