//! Model manager: which models are resident and which one is active.
//!
//! Loading is idempotent and monotonic: once a model is resident it stays for
//! the life of the process, and a repeated `load` only re-selects it.  A failed
//! load leaves the manager exactly as it was.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::{
    error::{Result, TtsError},
    registry::{LoadedModel, ModelBackend, ModelDescriptor, ModelRegistry},
};

/// A model materialised in memory, owned by the manager.
pub struct LoadedModelHandle {
    descriptor: ModelDescriptor,
    model: Box<dyn LoadedModel>,
}

impl LoadedModelHandle {
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn model(&self) -> &dyn LoadedModel {
        self.model.as_ref()
    }
}

/// Per-entry view used by the `/models` listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelStatus {
    pub descriptor: ModelDescriptor,
    pub loaded: bool,
    pub current: bool,
}

/// Outcome of a successful [`ModelManager::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The model was fetched and initialised by this call.
    Loaded,
    /// The model was already resident; it is now the active one.
    AlreadyLoaded,
}

/// Result of [`ModelManager::plan_load`].
pub enum LoadPlan {
    /// Resident already; only selection is left.
    AlreadyLoaded,
    /// Needs a build, which runs without access to the manager.
    Build(PendingLoad),
}

/// A registry entry whose artifacts still have to be fetched.
pub struct PendingLoad {
    descriptor: ModelDescriptor,
    backend: Arc<dyn ModelBackend>,
}

impl PendingLoad {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Fetch and initialise the model.  Blocking.
    pub fn build(self) -> Result<LoadedModelHandle> {
        let id = self.descriptor.id.clone();
        info!(model = %id, name = %self.descriptor.display_name, "loading model");
        let started = Instant::now();

        let model = self.backend.load(&self.descriptor).map_err(|source| {
            error!(model = %id, error = %format!("{source:#}"), "model load failed");
            TtsError::ModelLoad {
                id: id.clone(),
                source,
            }
        })?;

        info!(
            model = %id,
            sample_rate = model.sample_rate(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );
        Ok(LoadedModelHandle {
            descriptor: self.descriptor,
            model,
        })
    }
}

pub struct ModelManager {
    registry: ModelRegistry,
    loaded: HashMap<String, LoadedModelHandle>,
    active: Option<String>,
    device: String,
}

impl ModelManager {
    pub fn new(registry: ModelRegistry) -> Self {
        let device = "cpu".to_string();
        info!(device = %device, models = registry.len(), "model manager ready");
        Self {
            registry,
            loaded: HashMap::new(),
            active: None,
            device,
        }
    }

    /// Load `id` (if needed) and make it the active model.
    ///
    /// Holds `&mut self` for the whole build; callers sharing the manager
    /// behind a lock use [`plan_load`](Self::plan_load),
    /// [`PendingLoad::build`] and [`install`](Self::install) instead.
    pub fn load(&mut self, id: &str) -> Result<LoadOutcome> {
        match self.plan_load(id)? {
            LoadPlan::AlreadyLoaded => {
                self.select(id);
                Ok(LoadOutcome::AlreadyLoaded)
            }
            LoadPlan::Build(pending) => {
                let handle = pending.build()?;
                self.install(handle);
                Ok(LoadOutcome::Loaded)
            }
        }
    }

    /// Decide what loading `id` takes without touching any state.
    pub fn plan_load(&self, id: &str) -> Result<LoadPlan> {
        if self.loaded.contains_key(id) {
            return Ok(LoadPlan::AlreadyLoaded);
        }

        let Some(entry) = self.registry.entry(id) else {
            error!(model = id, "unknown model");
            return Err(TtsError::UnknownModel(id.to_string()));
        };

        if !entry.backend.is_supported() {
            warn!(model = id, "model family not supported yet");
            return Err(TtsError::UnsupportedModel(id.to_string()));
        }

        Ok(LoadPlan::Build(PendingLoad {
            descriptor: entry.descriptor.clone(),
            backend: entry.backend.clone(),
        }))
    }

    /// Make an already-resident model the active one.  Returns `false` when
    /// `id` is not resident.
    pub fn select(&mut self, id: &str) -> bool {
        if !self.loaded.contains_key(id) {
            return false;
        }
        info!(model = id, "model already loaded, selecting it");
        self.active = Some(id.to_string());
        true
    }

    /// Store a freshly built handle and make it active.  A handle that is
    /// already resident under the same id is kept.
    pub fn install(&mut self, handle: LoadedModelHandle) {
        let id = handle.descriptor.id.clone();
        self.loaded.entry(id.clone()).or_insert(handle);
        self.active = Some(id);
    }

    pub fn current_model(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded.contains_key(id)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Compute device name reported by `/health`.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// The active handle, if any.
    pub fn active_handle(&self) -> Option<&LoadedModelHandle> {
        self.active.as_deref().and_then(|id| self.loaded.get(id))
    }

    /// Registry entries annotated with residency and selection.
    pub fn models(&self) -> Vec<ModelStatus> {
        self.registry
            .list_all()
            .map(|d| ModelStatus {
                descriptor: d.clone(),
                loaded: self.is_loaded(&d.id),
                current: self.current_model() == Some(d.id.as_str()),
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::dispatch::SynthesisOptions;
    use crate::registry::{ModelBackend, Unimplemented};

    /// Emits a constant tone; records how often it was loaded.
    pub(crate) struct FakeBackend {
        pub loads: AtomicUsize,
        pub fail: bool,
    }

    impl FakeBackend {
        pub fn ok() -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                fail: false,
            })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    pub(crate) struct FakeModel;

    impl LoadedModel for FakeModel {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn synthesize(&self, text: &str, options: &SynthesisOptions) -> anyhow::Result<Vec<f32>> {
            if text == "boom" {
                anyhow::bail!("numerical failure");
            }
            Ok(vec![0.25 + options.speaker_id as f32 * 0.01; text.len() * 10])
        }
    }

    impl ModelBackend for FakeBackend {
        fn load(&self, _descriptor: &ModelDescriptor) -> anyhow::Result<Box<dyn LoadedModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("artifact not found");
            }
            Ok(Box::new(FakeModel))
        }
    }

    pub(crate) fn fake_registry(backend: Arc<FakeBackend>) -> ModelRegistry {
        ModelRegistry::new()
            .with_model(ModelDescriptor::speecht5(), backend)
            .unwrap()
            .with_model(ModelDescriptor::cosyvoice(), Arc::new(Unimplemented))
            .unwrap()
    }

    #[test]
    fn test_fresh_manager_has_nothing_active() {
        let manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        assert_eq!(manager.current_model(), None);
        assert_eq!(manager.loaded_count(), 0);
        assert!(manager.active_handle().is_none());
        assert_eq!(manager.device(), "cpu");
    }

    #[test]
    fn test_load_sets_active() {
        let mut manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        assert_eq!(manager.load("speecht5").unwrap(), LoadOutcome::Loaded);
        assert_eq!(manager.current_model(), Some("speecht5"));
        assert!(manager.is_loaded("speecht5"));
        assert_eq!(manager.loaded_count(), 1);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let backend = FakeBackend::ok();
        let mut manager = ModelManager::new(fake_registry(backend.clone()));
        manager.load("speecht5").unwrap();
        assert_eq!(manager.load("speecht5").unwrap(), LoadOutcome::AlreadyLoaded);
        assert_eq!(manager.load("speecht5").unwrap(), LoadOutcome::AlreadyLoaded);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert_eq!(manager.loaded_count(), 1);
        assert_eq!(manager.current_model(), Some("speecht5"));
    }

    #[test]
    fn test_unknown_model_leaves_state_unchanged() {
        let mut manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        manager.load("speecht5").unwrap();
        for id in ["", "tacotron", "SPEECHT5", "speecht5 "] {
            let err = manager.load(id).unwrap_err();
            assert!(matches!(err, TtsError::UnknownModel(_)), "{id:?}: {err}");
        }
        assert_eq!(manager.current_model(), Some("speecht5"));
        assert_eq!(manager.loaded_count(), 1);
    }

    #[test]
    fn test_unsupported_family_does_not_mutate() {
        let mut manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        let err = manager.load("cosyvoice").unwrap_err();
        assert!(matches!(err, TtsError::UnsupportedModel(_)));
        assert_eq!(manager.current_model(), None);
        assert!(!manager.is_loaded("cosyvoice"));
    }

    #[test]
    fn test_failed_load_stores_no_handle() {
        let mut manager = ModelManager::new(fake_registry(FakeBackend::failing()));
        let err = manager.load("speecht5").unwrap_err();
        assert!(matches!(err, TtsError::ModelLoad { .. }));
        assert!(err.to_string().contains("artifact not found"));
        assert_eq!(manager.loaded_count(), 0);
        assert_eq!(manager.current_model(), None);
    }

    #[test]
    fn test_status_flags_follow_state() {
        let mut manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        manager.load("speecht5").unwrap();
        let models = manager.models();
        assert_eq!(models.len(), 2);
        for status in &models {
            assert_eq!(status.loaded, manager.is_loaded(&status.descriptor.id));
            assert_eq!(
                status.current,
                manager.current_model() == Some(status.descriptor.id.as_str())
            );
        }
        assert!(models[0].current && models[0].loaded);
        assert!(!models[1].current && !models[1].loaded);
    }

    #[test]
    fn test_planned_build_runs_without_the_manager() {
        let backend = FakeBackend::ok();
        let mut manager = ModelManager::new(fake_registry(backend.clone()));

        let LoadPlan::Build(pending) = manager.plan_load("speecht5").unwrap() else {
            panic!("expected a build plan");
        };
        assert_eq!(pending.id(), "speecht5");
        // Nothing changes until the handle is installed.
        assert_eq!(manager.loaded_count(), 0);
        assert_eq!(manager.current_model(), None);

        let handle = pending.build().unwrap();
        assert_eq!(manager.loaded_count(), 0);
        manager.install(handle);
        assert_eq!(manager.current_model(), Some("speecht5"));
        assert!(matches!(
            manager.plan_load("speecht5").unwrap(),
            LoadPlan::AlreadyLoaded
        ));
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plan_load_errors() {
        let manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        assert!(matches!(
            manager.plan_load("tacotron"),
            Err(TtsError::UnknownModel(_))
        ));
        assert!(matches!(
            manager.plan_load("cosyvoice"),
            Err(TtsError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn test_select_requires_resident_model() {
        let mut manager = ModelManager::new(fake_registry(FakeBackend::ok()));
        assert!(!manager.select("speecht5"));
        assert_eq!(manager.current_model(), None);
        manager.load("speecht5").unwrap();
        assert!(manager.select("speecht5"));
    }
}
