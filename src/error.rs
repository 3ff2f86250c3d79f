//! Crate-level error type.
//!
//! Internal plumbing (ONNX Runtime, hub downloads, file parsing) works with
//! [`anyhow::Result`]; the manager and dispatcher translate those failures into
//! one of the [`TtsError`] kinds so callers can tell "not supported" from
//! "failed this time".

use thiserror::Error;

/// Result alias used by the registry, manager and dispatcher.
pub type Result<T> = std::result::Result<T, TtsError>;

#[derive(Debug, Error)]
pub enum TtsError {
    /// The id is not present in the model registry.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// The family is known but has no loading / synthesis routine.
    #[error("model '{0}' is not supported yet")]
    UnsupportedModel(String),

    /// Fetching or initialising the model artifacts failed.
    #[error("failed to load model '{id}': {source:#}")]
    ModelLoad {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Synthesis was requested before any model was loaded.
    #[error("no model is loaded")]
    NoActiveModel,

    /// Generation or encoding failed.
    #[error("synthesis failed: {0:#}")]
    Synthesis(#[source] anyhow::Error),

    /// Malformed request input.
    #[error("{0}")]
    Validation(String),

    /// Two registry entries share the same id.
    #[error("model '{0}' is already registered")]
    DuplicateModel(String),
}

impl TtsError {
    pub fn synthesis(err: impl Into<anyhow::Error>) -> Self {
        Self::Synthesis(err.into())
    }

    /// `true` for errors caused by the request itself rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
