//! HTTP surface.
//!
//! Every route is a plain request/response mapping over the shared
//! [`ModelManager`].  Loads are serialized by their own mutex and build the
//! model on the blocking pool without holding the manager lock; the write lock
//! is taken only to install the result.  Synthesis holds the read lock on the
//! blocking pool, so inference never stalls the async workers.

use std::{fmt, future::Future, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{Mutex, RwLock},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{self, AudioFormat},
    cache::{self, AudioCache, CacheKey},
    dispatch::{self, SynthesisOptions},
    error::TtsError,
    manager::{LoadOutcome, LoadPlan, ModelManager},
    registry::SpeedLabel,
};

const SERVICE_NAME: &str = "MyDictionary TTS Server";

/// Names the cached file a `/synthesize` response was stored as; fetch it
/// again from `/audio/{id}.{ext}`.
pub const AUDIO_ID_HEADER: HeaderName = HeaderName::from_static("x-audio-id");

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Shared across all requests.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<RwLock<ModelManager>>,
    load_lock: Arc<Mutex<()>>,
    cache: Option<Arc<AudioCache>>,
}

impl AppState {
    pub fn new(manager: ModelManager) -> Self {
        Self {
            manager: Arc::new(RwLock::new(manager)),
            load_lock: Arc::new(Mutex::new(())),
            cache: None,
        }
    }

    /// Serve repeated requests from `cache`.
    pub fn with_cache(mut self, cache: AudioCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn manager(&self) -> &Arc<RwLock<ModelManager>> {
        &self.manager
    }

    /// Load and select `id`.
    ///
    /// One load runs at a time.  The build itself happens on the blocking pool
    /// with no manager lock held, so metadata routes and synthesis on the
    /// current model keep answering while artifacts download.
    pub async fn load_model(&self, id: String) -> Result<LoadOutcome, ApiError> {
        let _serialized = self.load_lock.lock().await;

        let plan = self.manager.read().await.plan_load(&id)?;
        match plan {
            LoadPlan::AlreadyLoaded => {
                self.manager.write().await.select(&id);
                Ok(LoadOutcome::AlreadyLoaded)
            }
            LoadPlan::Build(pending) => {
                let handle = tokio::task::spawn_blocking(move || pending.build())
                    .await
                    .map_err(ApiError::from_join)??;
                self.manager.write().await.install(handle);
                Ok(LoadOutcome::Loaded)
            }
        }
    }

    /// Synthesize and encode on the blocking pool.
    async fn render(&self, request: RenderRequest) -> Result<Rendered, ApiError> {
        let state = self.clone();
        tokio::task::spawn_blocking(move || state.render_blocking(&request))
            .await
            .map_err(ApiError::from_join)?
            .map_err(ApiError::from)
    }

    fn render_blocking(&self, request: &RenderRequest) -> Result<Rendered, TtsError> {
        let manager = self.manager.blocking_read();
        let active = manager.active_handle().ok_or(TtsError::NoActiveModel)?;
        let model = active.descriptor().id.as_str();
        let key = CacheKey {
            model,
            voice_revision: active.model().voice_revision(),
            speaker_id: request.options.speaker_id,
            format: request.format,
            text: &request.text,
        };
        if let Some(bytes) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            info!(model, format = %request.format, "served from audio cache");
            return Ok(Rendered {
                bytes,
                file_id: Some(key.file_id()),
            });
        }

        let audio = dispatch::synthesize(&manager, &request.text, &request.options)?;
        let bytes = audio::encode(&audio.samples, audio.sample_rate, request.format)
            .inspect_err(|e| error!(format = %request.format, error = %e, "encoding failed"))?;

        let file_id = self.cache.as_ref().and_then(|cache| {
            cache
                .put(&key, &bytes)
                .inspect_err(|e| warn!(error = %format!("{e:#}"), "failed to write audio cache"))
                .ok()
        });
        Ok(Rendered { bytes, file_id })
    }

    /// Bytes of a previously cached clip, read on the blocking pool.
    async fn cached_audio(&self, file: &str) -> Result<(AudioFormat, Vec<u8>), ApiError> {
        let (id, format) = cache::parse_file_name(file).ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("invalid audio file name: {file}"),
            )
        })?;
        let not_found = || ApiError::new(StatusCode::NOT_FOUND, format!("audio not found: {file}"));

        let cache = self.cache.clone().ok_or_else(not_found)?;
        let id = id.to_string();
        let bytes = tokio::task::spawn_blocking(move || cache.get_by_id(&id, format))
            .await
            .map_err(ApiError::from_join)?
            .ok_or_else(not_found)?;
        Ok((format, bytes))
    }
}

#[derive(Debug)]
struct RenderRequest {
    text: String,
    options: SynthesisOptions,
    format: AudioFormat,
}

struct Rendered {
    bytes: Vec<u8>,
    /// Set when the clip is in the audio cache.
    file_id: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// `{success: false, error}` with 400 for bad requests, 404 for missing cached
/// audio and 500 otherwise.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: String) -> Self {
        Self { status, message }
    }

    fn from_join(err: tokio::task::JoinError) -> Self {
        error!(error = %err, "blocking task failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("worker task failed: {err}"),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<TtsError> for ApiError {
    fn from(err: TtsError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
    status: &'static str,
    current_model: Option<String>,
    available_models: Vec<String>,
}

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    name: String,
    language: String,
    quality: i32,
    speed: SpeedLabel,
    loaded: bool,
    current: bool,
}

#[derive(Serialize)]
struct ModelList {
    success: bool,
    models: Vec<ModelEntry>,
}

#[derive(Serialize)]
struct LoadResponse {
    success: bool,
    message: String,
    current_model: Option<String>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    device: String,
    models_loaded: usize,
    current_model: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SynthesizeRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    speaker_id: Option<usize>,
    #[serde(default)]
    format: Option<String>,
}

impl SynthesizeRequest {
    fn parse(body: &[u8]) -> Result<Self, TtsError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| TtsError::Validation(format!("invalid request body: {e}")))
    }

    fn into_render(self) -> Result<RenderRequest, TtsError> {
        let text = self
            .text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| TtsError::Validation("missing text parameter".into()))?;
        let format = match self.format {
            Some(f) => f.parse()?,
            None => AudioFormat::default(),
        };
        Ok(RenderRequest {
            text,
            options: SynthesisOptions {
                speaker_id: self.speaker_id.unwrap_or(0),
            },
            format,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn index(State(state): State<AppState>) -> Json<ServiceInfo> {
    let manager = state.manager.read().await;
    Json(ServiceInfo {
        name: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
        current_model: manager.current_model().map(str::to_string),
        available_models: manager.registry().ids(),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let manager = state.manager.read().await;
    let models = manager
        .models()
        .into_iter()
        .map(|s| ModelEntry {
            id: s.descriptor.id,
            name: s.descriptor.display_name,
            language: s.descriptor.language,
            quality: s.descriptor.quality,
            speed: s.descriptor.speed,
            loaded: s.loaded,
            current: s.current,
        })
        .collect();
    Json(ModelList {
        success: true,
        models,
    })
}

async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LoadResponse>, ApiError> {
    info!(model = %id, "load requested");
    let outcome = state
        .load_model(id.clone())
        .await
        .inspect_err(|e| error!(model = %id, error = %e, "load failed"))?;
    let message = match outcome {
        LoadOutcome::Loaded => format!("model '{id}' loaded"),
        LoadOutcome::AlreadyLoaded => format!("model '{id}' already loaded, now active"),
    };
    let current_model = state
        .manager
        .read()
        .await
        .current_model()
        .map(str::to_string);
    Ok(Json(LoadResponse {
        success: true,
        message,
        current_model,
    }))
}

async fn synthesize(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(AppendHeaders<Vec<(HeaderName, String)>>, Vec<u8>), ApiError> {
    let request = SynthesizeRequest::parse(&body)?.into_render()?;
    let format = request.format;
    let Rendered { bytes, file_id } = state.render(request).await?;

    let mut headers = vec![
        (header::CONTENT_TYPE, format.media_type()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"tts.{}\"", format.extension()),
        ),
    ];
    if let Some(id) = file_id {
        headers.push((AUDIO_ID_HEADER, id));
    }
    Ok((AppendHeaders(headers), bytes))
}

async fn audio_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<([(HeaderName, String); 1], Vec<u8>), ApiError> {
    let (format, bytes) = state.cached_audio(&file).await?;
    debug!(file = %file, bytes = bytes.len(), "serving cached audio");
    Ok(([(header::CONTENT_TYPE, format.media_type())], bytes))
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let manager = state.manager.read().await;
    Json(Health {
        status: "healthy",
        device: manager.device().to_string(),
        models_loaded: manager.loaded_count(),
        current_model: manager.current_model().map(str::to_string),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Router / serve
// ─────────────────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/models", get(list_models))
        .route("/models/{id}/load", post(load_model))
        .route("/synthesize", post(synthesize))
        .route("/audio/{file}", get(audio_file))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req = SynthesizeRequest::parse(br#"{"text": "hi"}"#)
            .unwrap()
            .into_render()
            .unwrap();
        assert_eq!(req.text, "hi");
        assert_eq!(req.options.speaker_id, 0);
        assert_eq!(req.format, AudioFormat::Wav);
    }

    #[test]
    fn test_request_fields() {
        let body = br#"{"text": "hi", "speaker_id": 3, "format": "mp3"}"#;
        let req = SynthesizeRequest::parse(body)
            .unwrap()
            .into_render()
            .unwrap();
        assert_eq!(req.options.speaker_id, 3);
        assert_eq!(req.format, AudioFormat::Mp3);
    }

    #[test]
    fn test_missing_or_blank_text() {
        for body in [&b""[..], b"{}", br#"{"text": "   "}"#, br#"{"text": null}"#] {
            let err = SynthesizeRequest::parse(body)
                .unwrap()
                .into_render()
                .unwrap_err();
            assert!(err.is_client_error());
            assert_eq!(err.to_string(), "missing text parameter");
        }
    }

    #[test]
    fn test_malformed_bodies() {
        let err = SynthesizeRequest::parse(b"{not json").unwrap_err();
        assert!(err.is_client_error());
        assert!(SynthesizeRequest::parse(br#"{"text": "a", "speaker_id": -1}"#).is_err());
        let err = SynthesizeRequest::parse(br#"{"text": "a", "format": "ogg"}"#)
            .unwrap()
            .into_render()
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_api_error_status() {
        let bad: ApiError = TtsError::Validation("x".into()).into();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
        let internal: ApiError = TtsError::NoActiveModel.into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_api_error_displays_message() {
        let err: ApiError = TtsError::UnknownModel("nope".into()).into();
        assert_eq!(err.to_string(), TtsError::UnknownModel("nope".into()).to_string());
        assert_eq!(format!("{err}"), err.message);
    }

    #[test]
    fn test_requests_are_debug() {
        let parsed = SynthesizeRequest::parse(br#"{"text": "hi"}"#).unwrap();
        assert!(format!("{parsed:?}").contains("hi"));
        let render = parsed.into_render().unwrap();
        assert!(format!("{render:?}").contains("speaker_id"));
    }
}
