//! HuggingFace Hub access for model artifacts.
//!
//! Files land in the hub cache (`~/.cache/huggingface/hub` unless overridden)
//! and are reused on later runs, so only the first load of a model touches
//! the network.

use std::path::PathBuf;

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiBuilder};
use tracing::info;

/// Thin wrapper around the synchronous hub client.
pub struct Hub {
    api: Api,
}

impl Hub {
    /// Build a client, optionally pointing it at a custom cache directory.
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        let mut builder = ApiBuilder::from_env().with_progress(false);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        let api = builder.build().context("failed to initialise HuggingFace Hub client")?;
        Ok(Self { api })
    }

    /// Download (or reuse the cached copy of) `filename` from `repo_id`.
    pub fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
        info!(repo = repo_id, file = filename, "fetching artifact");
        self.api
            .model(repo_id.to_string())
            .get(filename)
            .with_context(|| format!("failed to download '{filename}' from '{repo_id}'"))
    }
}
