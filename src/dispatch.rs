//! Synthesis dispatcher: routes a request to the active model.

use std::time::Instant;

use tracing::{error, info};

use crate::{
    error::{Result, TtsError},
    manager::ModelManager,
};

/// Request options understood by every family.  Families ignore what they
/// cannot use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisOptions {
    /// Row of the speaker-embedding table (voice) to condition on.
    pub speaker_id: usize,
}

/// Raw mono samples plus their rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Audio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Audio {
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Synthesize `text` with whichever model is currently active.
///
/// Single attempt; any failure from the model is surfaced as
/// [`TtsError::Synthesis`].
pub fn synthesize(manager: &ModelManager, text: &str, options: &SynthesisOptions) -> Result<Audio> {
    let handle = manager.active_handle().ok_or(TtsError::NoActiveModel)?;
    let model_id = &handle.descriptor().id;
    let started = Instant::now();

    let samples = handle.model().synthesize(text, options).map_err(|e| {
        error!(model = %model_id, error = %format!("{e:#}"), "synthesis failed");
        TtsError::Synthesis(e)
    })?;

    let audio = Audio {
        samples,
        sample_rate: handle.model().sample_rate(),
    };
    info!(
        model = %model_id,
        chars = text.chars().count(),
        samples = audio.samples.len(),
        seconds = audio.duration_secs(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "synthesized"
    );
    Ok(audio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::{fake_registry, FakeBackend};

    #[test]
    fn test_no_active_model() {
        let manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        let err = synthesize(&manager, "hello", &SynthesisOptions::default()).unwrap_err();
        assert!(matches!(err, TtsError::NoActiveModel));
    }

    #[test]
    fn test_routes_to_active_model() {
        let mut manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        manager.load("speecht5").unwrap();
        let options = SynthesisOptions { speaker_id: 2 };
        let audio = synthesize(&manager, "hello", &options).unwrap();
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.samples.len(), 50);
        assert!((audio.samples[0] - 0.27).abs() < 1e-6);
    }

    #[test]
    fn test_model_failure_is_synthesis_error() {
        let mut manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        manager.load("speecht5").unwrap();
        let err = synthesize(&manager, "boom", &SynthesisOptions::default()).unwrap_err();
        assert!(matches!(err, TtsError::Synthesis(_)));
        assert!(err.to_string().contains("numerical failure"));
    }

    #[test]
    fn test_duration() {
        let audio = Audio {
            samples: vec![0.0; 8_000],
            sample_rate: 16_000,
        };
        assert!((audio.duration_secs() - 0.5).abs() < f32::EPSILON);
    }
}
