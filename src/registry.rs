//! Model registry: the static table of known model configurations.
//!
//! Each entry pairs a [`ModelDescriptor`] with the [`ModelBackend`] able to
//! materialise it.  The registry is built once at startup and only read
//! afterwards; the manager never branches on model ids itself.

use std::{fmt, sync::Arc};

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::{
    dispatch::SynthesisOptions,
    error::{Result, TtsError},
    speecht5::{SpeechT5Backend, SpeechT5Settings},
};

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Informational speed category shown to the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedLabel {
    Fast,
    Medium,
    Slow,
}

impl fmt::Display for SpeedLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
        })
    }
}

/// Category of TTS model with its own loading / synthesis routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    SpeechT5,
    CosyVoice,
}

/// Static metadata for one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    /// Short unique key, e.g. `"speecht5"`.
    pub id: String,
    pub display_name: String,
    /// Hub repositories the artifacts are fetched from (model first, then
    /// any auxiliary component such as the vocoder).
    pub backing_ids: Vec<String>,
    /// Language / locale tag (`"en"`) or a multi-language marker (`"zh-en"`).
    pub language: String,
    /// Relative quality ranking; only meaningful compared to other entries.
    pub quality: i32,
    pub speed: SpeedLabel,
    pub family: ModelFamily,
}

impl ModelDescriptor {
    pub fn speecht5() -> Self {
        Self {
            id: "speecht5".into(),
            display_name: "SpeechT5 (English)".into(),
            backing_ids: vec!["Xenova/speecht5_tts".into(), "Xenova/speecht5_hifigan".into()],
            language: "en".into(),
            quality: 6,
            speed: SpeedLabel::Fast,
            family: ModelFamily::SpeechT5,
        }
    }

    pub fn cosyvoice() -> Self {
        Self {
            id: "cosyvoice".into(),
            display_name: "CosyVoice (中英文)".into(),
            backing_ids: vec!["FunAudioLLM/CosyVoice-300M".into()],
            language: "zh-en".into(),
            quality: 9,
            speed: SpeedLabel::Medium,
            family: ModelFamily::CosyVoice,
        }
    }

    /// Primary artifact repository.
    pub fn model_repo(&self) -> Option<&str> {
        self.backing_ids.first().map(String::as_str)
    }

    /// Auxiliary (vocoder) repository, when the family uses one.
    pub fn vocoder_repo(&self) -> Option<&str> {
        self.backing_ids.get(1).map(String::as_str)
    }
}

/// Built-in table, in the order it is listed to clients.
static BUILTIN_MODELS: Lazy<Vec<ModelDescriptor>> =
    Lazy::new(|| vec![ModelDescriptor::speecht5(), ModelDescriptor::cosyvoice()]);

// ─────────────────────────────────────────────────────────────────────────────
// Family seams
// ─────────────────────────────────────────────────────────────────────────────

/// A model resident in memory, ready to synthesize.
pub trait LoadedModel: Send + Sync {
    /// Fixed output sample rate of this family.
    fn sample_rate(&self) -> u32;

    /// Produce raw mono samples for `text`.
    fn synthesize(&self, text: &str, options: &SynthesisOptions) -> anyhow::Result<Vec<f32>>;

    /// Changes whenever on-disk voice data read at synthesis time changes.
    /// Mixed into audio cache keys.
    fn voice_revision(&self) -> u64 {
        0
    }
}

/// Loading routine for one model family.
pub trait ModelBackend: Send + Sync {
    /// Families without an implementation return `false`; the manager then
    /// reports [`TtsError::UnsupportedModel`] without calling [`load`](Self::load).
    fn is_supported(&self) -> bool {
        true
    }

    /// Fetch and initialise everything the model needs.  Blocking.
    fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<Box<dyn LoadedModel>>;
}

/// Placeholder backend for families that are listed but not implemented.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unimplemented;

impl ModelBackend for Unimplemented {
    fn is_supported(&self) -> bool {
        false
    }

    fn load(&self, descriptor: &ModelDescriptor) -> anyhow::Result<Box<dyn LoadedModel>> {
        anyhow::bail!("no loader for model family {:?}", descriptor.family)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct RegisteredModel {
    pub(crate) descriptor: ModelDescriptor,
    pub(crate) backend: Arc<dyn ModelBackend>,
}

/// Ordered, id-unique collection of model entries.
#[derive(Default)]
pub struct ModelRegistry {
    entries: Vec<RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production table: SpeechT5 backed by ONNX Runtime, CosyVoice
    /// listed but unimplemented.
    pub fn builtin(settings: SpeechT5Settings) -> Self {
        let speecht5: Arc<dyn ModelBackend> = Arc::new(SpeechT5Backend::new(settings));
        let mut registry = Self::new();
        for descriptor in BUILTIN_MODELS.iter() {
            let backend = match descriptor.family {
                ModelFamily::SpeechT5 => speecht5.clone(),
                ModelFamily::CosyVoice => Arc::new(Unimplemented) as Arc<dyn ModelBackend>,
            };
            registry.entries.push(RegisteredModel {
                descriptor: descriptor.clone(),
                backend,
            });
        }
        registry
    }

    /// Append an entry.  Ids must be unique.
    pub fn register(
        &mut self,
        descriptor: ModelDescriptor,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<()> {
        if self.describe(&descriptor.id).is_some() {
            return Err(TtsError::DuplicateModel(descriptor.id));
        }
        self.entries.push(RegisteredModel {
            descriptor,
            backend,
        });
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_model(
        mut self,
        descriptor: ModelDescriptor,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<Self> {
        self.register(descriptor, backend)?;
        Ok(self)
    }

    pub fn describe(&self, id: &str) -> Option<&ModelDescriptor> {
        self.entry(id).map(|e| &e.descriptor)
    }

    /// All descriptors in registration order.
    pub fn list_all(&self) -> impl Iterator<Item = &ModelDescriptor> + '_ {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn ids(&self) -> Vec<String> {
        self.list_all().map(|d| d.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, id: &str) -> Option<&RegisteredModel> {
        self.entries.iter().find(|e| e.descriptor.id == id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
