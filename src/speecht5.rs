//! SpeechT5 text-to-speech on ONNX Runtime.
//!
//! Uses the ONNX export of `microsoft/speecht5_tts` split into three graphs:
//!
//! | Graph                          | Inputs → outputs                                  |
//! |--------------------------------|---------------------------------------------------|
//! | `encoder_model.onnx`           | `input_ids [1, T]` → `last_hidden_state [1, T, H]` |
//! | `decoder_model_merged.onnx`    | previous mel frames, encoder states, speaker x-vector, KV cache → `spectrum`, `prob`, next `output_sequence_out`, `present.*` |
//! | HiFi-GAN `model.onnx`          | `spectrogram [frames, mels]` → `waveform`          |
//!
//! The decoder runs autoregressively, `reduction_factor` mel frames per
//! step, until the stop probability crosses [`STOP_THRESHOLD`] or the length
//! cap is hit.

use std::{
    borrow::Cow,
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, ensure, Context, Result};
use ort::{
    session::{Session, SessionInputValue, SessionInputs},
    value::{DynValue, Tensor},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    dispatch::SynthesisOptions,
    download::Hub,
    embeddings::{EmbeddingSource, MissingEmbeddings, DEFAULT_EMBEDDINGS_FILE},
    registry::{LoadedModel, ModelBackend, ModelDescriptor},
    tokenize::CharVocab,
};

/// Output sample rate of the HiFi-GAN vocoder.
pub const SAMPLE_RATE: u32 = 16_000;

/// Stop-token probability that ends generation.
pub const STOP_THRESHOLD: f32 = 0.5;

/// Decoder steps allowed per encoder position (after reduction).
const MAX_LEN_RATIO: f32 = 20.0;
const MIN_LEN_RATIO: f32 = 0.0;

/// Maximum characters per text chunk before splitting.
const CHUNK_MAX_CHARS: usize = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Settings / config
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime knobs for the SpeechT5 backend.
#[derive(Debug, Clone)]
pub struct SpeechT5Settings {
    pub embeddings_path: PathBuf,
    pub on_missing_embeddings: MissingEmbeddings,
    pub hf_cache_dir: Option<PathBuf>,
    /// Use the int8 `*_quantized.onnx` graphs.
    pub quantized: bool,
}

impl Default for SpeechT5Settings {
    fn default() -> Self {
        Self {
            embeddings_path: PathBuf::from(DEFAULT_EMBEDDINGS_FILE),
            on_missing_embeddings: MissingEmbeddings::ZeroFill,
            hf_cache_dir: None,
            quantized: false,
        }
    }
}

/// The subset of `config.json` the runtime needs.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechT5Config {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_decoder_heads")]
    pub decoder_attention_heads: usize,
    #[serde(default = "default_num_mel_bins")]
    pub num_mel_bins: usize,
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: usize,
    #[serde(default = "default_speaker_embedding_dim")]
    pub speaker_embedding_dim: usize,
    #[serde(default = "default_max_text_positions")]
    pub max_text_positions: usize,
}

fn default_hidden_size() -> usize {
    768
}

fn default_decoder_heads() -> usize {
    12
}

fn default_num_mel_bins() -> usize {
    80
}

fn default_reduction_factor() -> usize {
    2
}

fn default_speaker_embedding_dim() -> usize {
    512
}

fn default_max_text_positions() -> usize {
    600
}

impl SpeechT5Config {
    fn head_dim(&self) -> usize {
        self.hidden_size / self.decoder_attention_heads.max(1)
    }
}

fn graph_file(stem: &str, quantized: bool) -> String {
    if quantized {
        format!("onnx/{stem}_quantized.onnx")
    } else {
        format!("onnx/{stem}.onnx")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Text chunker
// ─────────────────────────────────────────────────────────────────────────────

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？')
}

/// Split `text` into sentences (terminators kept) of at most `max_chars`
/// characters; longer sentences are wrapped on whitespace.
fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if is_sentence_end(c) {
            sentences.push(std::mem::take(&mut current));
        }
    }
    sentences.push(current);

    let mut chunks = Vec::new();
    for sentence in sentences {
        let sentence = sentence.split_whitespace().collect::<Vec<_>>().join(" ");
        if sentence.is_empty() {
            continue;
        }
        if sentence.chars().count() <= max_chars {
            chunks.push(sentence);
            continue;
        }
        let mut line = String::new();
        for word in sentence.split(' ') {
            let needed =
                line.chars().count() + usize::from(!line.is_empty()) + word.chars().count();
            if !line.is_empty() && needed > max_chars {
                chunks.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }
        if !line.is_empty() {
            chunks.push(line);
        }
    }
    chunks
}

// ─────────────────────────────────────────────────────────────────────────────
// Tensor helpers
// ─────────────────────────────────────────────────────────────────────────────

/// An owned tensor copied out of a session run.
#[derive(Debug, Clone)]
struct Owned {
    shape: Vec<i64>,
    data: Vec<f32>,
}

impl Owned {
    fn zeros(shape: Vec<i64>) -> Self {
        let n = shape.iter().map(|&d| d.max(0) as usize).product();
        Self {
            shape,
            data: vec![0.0; n],
        }
    }

    fn to_value(&self) -> Result<DynValue> {
        Ok(Tensor::<f32>::from_array((self.shape.clone(), self.data.clone()))?.into_dyn())
    }
}

fn extract(value: Option<&DynValue>, name: &str) -> Result<Owned> {
    let value = value.with_context(|| format!("graph has no output '{name}'"))?;
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .with_context(|| format!("failed to extract '{name}'"))?;
    Ok(Owned {
        shape: shape.to_vec(),
        data: data.to_vec(),
    })
}

fn lock<'a>(
    session: &'a Mutex<Session>,
    which: &str,
) -> Result<std::sync::MutexGuard<'a, Session>> {
    session
        .lock()
        .map_err(|_| anyhow!("{which} session mutex poisoned"))
}

fn open_session(path: &Path) -> Result<Session> {
    Session::builder()
        .context("failed to create ORT session builder")?
        .commit_from_file(path)
        .with_context(|| format!("cannot load ONNX model: {}", path.display()))
}

fn input_names(session: &Session) -> Vec<String> {
    session.inputs().iter().map(|i| i.name().to_string()).collect()
}

fn output_names(session: &Session) -> Vec<String> {
    session.outputs().iter().map(|o| o.name().to_string()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// KV cache bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

/// One `past_key_values.{layer}.{decoder|encoder}.{key|value}` input and the
/// `present.*` output that refreshes it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KvSlot {
    input: String,
    output: String,
    /// Cross-attention entries are computed on the first step only.
    cross: bool,
}

fn kv_slots(inputs: &[String]) -> Vec<KvSlot> {
    inputs
        .iter()
        .filter(|name| name.starts_with("past_key_values."))
        .map(|name| KvSlot {
            input: name.clone(),
            output: name.replacen("past_key_values", "present", 1),
            cross: name.contains(".encoder."),
        })
        .collect()
}

/// Generation ends once `step >= minlen` and either a stop probability
/// crossed the threshold or `maxlen` was reached.
fn should_stop(step: usize, minlen: usize, maxlen: usize, probs: &[f32]) -> bool {
    step >= minlen && (probs.iter().any(|&p| p >= STOP_THRESHOLD) || step >= maxlen)
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

pub struct SpeechT5Backend {
    settings: SpeechT5Settings,
}

impl SpeechT5Backend {
    pub fn new(settings: SpeechT5Settings) -> Self {
        Self { settings }
    }
}

impl ModelBackend for SpeechT5Backend {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn LoadedModel>> {
        let model_repo = descriptor
            .model_repo()
            .context("descriptor has no model repository")?;
        let vocoder_repo = descriptor
            .vocoder_repo()
            .context("descriptor has no vocoder repository")?;
        let quantized = self.settings.quantized;

        let hub = Hub::new(self.settings.hf_cache_dir.clone())?;
        let config_path = hub.fetch(model_repo, "config.json")?;
        let tokenizer_path = hub.fetch(model_repo, "tokenizer.json")?;
        let encoder_path = hub.fetch(model_repo, &graph_file("encoder_model", quantized))?;
        let decoder_path = hub.fetch(model_repo, &graph_file("decoder_model_merged", quantized))?;
        let vocoder_path = hub.fetch(vocoder_repo, &graph_file("model", quantized))?;

        let model = SpeechT5Model::load(
            &SpeechT5Files {
                config: config_path,
                tokenizer: tokenizer_path,
                encoder: encoder_path,
                decoder: decoder_path,
                vocoder: vocoder_path,
            },
            &self.settings,
        )?;
        Ok(Box::new(model))
    }
}

/// Local paths of every artifact [`SpeechT5Model`] needs.
#[derive(Debug, Clone)]
pub struct SpeechT5Files {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub encoder: PathBuf,
    pub decoder: PathBuf,
    pub vocoder: PathBuf,
}

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

pub struct SpeechT5Model {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    vocoder: Mutex<Session>,
    vocab: CharVocab,
    config: SpeechT5Config,
    embeddings: EmbeddingSource,
    encoder_inputs: Vec<String>,
    decoder_inputs: Vec<String>,
    kv: Vec<KvSlot>,
}

impl SpeechT5Model {
    /// Build the model from already-downloaded files.
    pub fn load(files: &SpeechT5Files, settings: &SpeechT5Settings) -> Result<Self> {
        let config_bytes = std::fs::read(&files.config)
            .with_context(|| format!("cannot read config: {}", files.config.display()))?;
        let config: SpeechT5Config =
            serde_json::from_slice(&config_bytes).context("failed to parse config.json")?;

        let vocab = CharVocab::load(&files.tokenizer)?;
        info!(tokens = vocab.len(), "tokenizer ready");

        info!("creating ONNX sessions");
        let encoder = open_session(&files.encoder)?;
        let decoder = open_session(&files.decoder)?;
        let vocoder = open_session(&files.vocoder)?;

        let encoder_inputs = input_names(&encoder);
        let decoder_inputs = input_names(&decoder);
        let decoder_outputs = output_names(&decoder);
        for required in ["output_sequence", "encoder_hidden_states", "speaker_embeddings"] {
            ensure!(
                decoder_inputs.iter().any(|n| n == required),
                "decoder graph is missing input '{required}'"
            );
        }
        for required in ["output_sequence_out", "spectrum", "prob"] {
            ensure!(
                decoder_outputs.iter().any(|n| n == required),
                "decoder graph is missing output '{required}'"
            );
        }
        let kv = kv_slots(&decoder_inputs);
        debug!(slots = kv.len(), "decoder KV cache layout");

        let embeddings = EmbeddingSource::new(
            settings.embeddings_path.clone(),
            config.speaker_embedding_dim,
            settings.on_missing_embeddings,
        );

        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            vocoder: Mutex::new(vocoder),
            vocab,
            config,
            embeddings,
            encoder_inputs,
            decoder_inputs,
            kv,
        })
    }

    fn has_decoder_input(&self, name: &str) -> bool {
        self.decoder_inputs.iter().any(|n| n == name)
    }

    /// `input_ids` → encoder hidden states `[1, T, H]`.
    fn encode(&self, ids: &[i64]) -> Result<Owned> {
        let seq_len = ids.len();
        let mut inputs: Vec<(Cow<'static, str>, SessionInputValue<'static>)> = vec![(
            "input_ids".into(),
            Tensor::<i64>::from_array(([1usize, seq_len], ids.to_vec()))
                .context("failed to build input_ids tensor")?
                .into_dyn()
                .into(),
        )];
        if self.encoder_inputs.iter().any(|n| n == "attention_mask") {
            inputs.push((
                "attention_mask".into(),
                Tensor::<i64>::from_array(([1usize, seq_len], vec![1i64; seq_len]))?
                    .into_dyn()
                    .into(),
            ));
        }

        let mut session = lock(&self.encoder, "encoder")?;
        let outputs = session
            .run(SessionInputs::from(inputs))
            .context("encoder inference failed")?;
        let hidden = extract(outputs.get("last_hidden_state"), "last_hidden_state")?;
        Ok(hidden)
    }

    /// Autoregressive mel generation; returns flat `[frames * num_mel_bins]`.
    fn decode(&self, hidden: &Owned, speaker: &[f32]) -> Result<Vec<f32>> {
        let mels = self.config.num_mel_bins;
        let enc_len = *hidden.shape.get(1).context("encoder output has no sequence axis")? as usize;
        let steps_ratio = enc_len as f32 / self.config.reduction_factor.max(1) as f32;
        let maxlen = (steps_ratio * MAX_LEN_RATIO) as usize;
        let minlen = (steps_ratio * MIN_LEN_RATIO) as usize;

        let heads = self.config.decoder_attention_heads as i64;
        let head_dim = self.config.head_dim() as i64;
        let mut cache: HashMap<&str, Owned> = self
            .kv
            .iter()
            .map(|slot| (slot.input.as_str(), Owned::zeros(vec![1, heads, 0, head_dim])))
            .collect();

        let mut output_sequence = Owned::zeros(vec![1, 1, mels as i64]);
        let encoder_mask = vec![1i64; enc_len];
        let mut spectrogram = Vec::new();

        let mut session = lock(&self.decoder, "decoder")?;
        let mut step = 0usize;
        loop {
            step += 1;
            let mut inputs: Vec<(Cow<'static, str>, SessionInputValue<'static>)> = vec![
                ("output_sequence".into(), output_sequence.to_value()?.into()),
                ("encoder_hidden_states".into(), hidden.to_value()?.into()),
                (
                    "speaker_embeddings".into(),
                    Tensor::<f32>::from_array(([1usize, speaker.len()], speaker.to_vec()))?
                        .into_dyn()
                        .into(),
                ),
            ];
            if self.has_decoder_input("encoder_attention_mask") {
                inputs.push((
                    "encoder_attention_mask".into(),
                    Tensor::<i64>::from_array(([1usize, enc_len], encoder_mask.clone()))?
                        .into_dyn()
                        .into(),
                ));
            }
            if self.has_decoder_input("use_cache_branch") {
                inputs.push((
                    "use_cache_branch".into(),
                    Tensor::<bool>::from_array(([1usize], vec![step > 1]))?
                        .into_dyn()
                        .into(),
                ));
            }
            for slot in &self.kv {
                let past = cache
                    .get(slot.input.as_str())
                    .with_context(|| format!("no cache entry for '{}'", slot.input))?;
                inputs.push((slot.input.clone().into(), past.to_value()?.into()));
            }

            let outputs = session
                .run(SessionInputs::from(inputs))
                .with_context(|| format!("decoder inference failed at step {step}"))?;

            let spectrum = extract(outputs.get("spectrum"), "spectrum")?;
            let prob = extract(outputs.get("prob"), "prob")?;
            output_sequence = extract(outputs.get("output_sequence_out"), "output_sequence_out")?;
            for slot in &self.kv {
                if slot.cross && step > 1 {
                    continue;
                }
                let present = extract(outputs.get(slot.output.as_str()), &slot.output)?;
                cache.insert(slot.input.as_str(), present);
            }
            drop(outputs);

            spectrogram.extend_from_slice(&spectrum.data);
            if should_stop(step, minlen, maxlen, &prob.data) {
                break;
            }
        }
        debug!(steps = step, frames = spectrogram.len() / mels.max(1), "decoder finished");
        Ok(spectrogram)
    }

    /// Mel spectrogram → waveform.
    fn vocode(&self, spectrogram: Vec<f32>) -> Result<Vec<f32>> {
        let mels = self.config.num_mel_bins;
        ensure!(
            mels > 0 && spectrogram.len() % mels == 0,
            "spectrogram length {} is not a multiple of {mels} mel bins",
            spectrogram.len()
        );
        let frames = spectrogram.len() / mels;
        let tensor = Tensor::<f32>::from_array(([frames, mels], spectrogram))
            .context("failed to build spectrogram tensor")?;

        let mut session = lock(&self.vocoder, "vocoder")?;
        let outputs = session
            .run(ort::inputs!["spectrogram" => tensor])
            .context("vocoder inference failed")?;
        let waveform = extract(outputs.get("waveform"), "waveform")?;
        Ok(waveform.data)
    }

    fn synthesize_chunk(&self, text: &str, speaker: &[f32]) -> Result<Vec<f32>> {
        let mut ids = self.vocab.encode(text);
        let cap = self.config.max_text_positions;
        if ids.len() > cap {
            warn!(tokens = ids.len(), cap, "chunk exceeds text positions, truncating");
            ids.truncate(cap.saturating_sub(1));
            ids.push(self.vocab.eos_id());
        }
        let hidden = self.encode(&ids)?;
        let spectrogram = self.decode(&hidden, speaker)?;
        self.vocode(spectrogram)
    }
}

impl LoadedModel for SpeechT5Model {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn synthesize(&self, text: &str, options: &SynthesisOptions) -> Result<Vec<f32>> {
        let speaker = self.embeddings.resolve(options.speaker_id)?;

        let chunks = chunk_text(text, CHUNK_MAX_CHARS);
        let mut audio = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            debug!(chunk = i, chars = chunk.chars().count(), "synthesizing chunk");
            let samples = self
                .synthesize_chunk(chunk, &speaker)
                .with_context(|| format!("chunk {i} ({chunk:?})"))?;
            audio.extend(samples);
        }
        Ok(audio)
    }

    fn voice_revision(&self) -> u64 {
        self.embeddings.revision()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
