//! Speaker (voice) embeddings.
//!
//! The optional artifact is a float matrix `[num_speakers, dim]` stored as
//! `.npy`, or an `.npz` holding such a matrix.  It is read on every synthesis
//! call, so dropping a file in place takes effect without a restart;
//! [`EmbeddingSource::revision`] tracks such replacements for cache keys.
//!
//! When the file is absent the routine falls back to an all-zero vector of the
//! model's embedding size.  Audio still comes out, in a flat default voice.
//! [`MissingEmbeddings::Error`] turns that fallback into a hard failure.

use std::{
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, warn};

use crate::npz::{load_npy, load_npz, NpyArray};

pub const DEFAULT_EMBEDDINGS_FILE: &str = "speaker_embeddings.npy";

/// NPZ member names tried before falling back to the first array.
const NPZ_KEYS: [&str; 3] = ["speaker_embeddings", "embeddings", "xvectors"];

/// What to do when the embeddings artifact does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingEmbeddings {
    /// Use a zero vector and log a warning.
    #[default]
    ZeroFill,
    /// Fail the synthesis.
    Error,
}

#[derive(Debug, Clone)]
pub struct EmbeddingSource {
    path: PathBuf,
    dim: usize,
    on_missing: MissingEmbeddings,
}

impl EmbeddingSource {
    pub fn new(path: impl Into<PathBuf>, dim: usize, on_missing: MissingEmbeddings) -> Self {
        Self {
            path: path.into(),
            dim,
            on_missing,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Modification time of the artifact in nanoseconds, `0` when absent.
    pub fn revision(&self) -> u64 {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as u64)
    }

    /// Embedding vector for `speaker_id`, length [`dim`](Self::dim).
    pub fn resolve(&self, speaker_id: usize) -> Result<Vec<f32>> {
        if !self.path.exists() {
            return match self.on_missing {
                MissingEmbeddings::ZeroFill => {
                    warn!(
                        path = %self.path.display(),
                        "speaker embeddings not found, using a zero vector"
                    );
                    Ok(vec![0.0; self.dim])
                }
                MissingEmbeddings::Error => {
                    bail!("speaker embeddings file not found: {}", self.path.display())
                }
            };
        }

        let table = self.read_table()?;
        ensure!(
            table.ncols() == self.dim,
            "speaker embeddings in {} have dimension {}, model expects {}",
            self.path.display(),
            table.ncols(),
            self.dim
        );
        let row = table.row(speaker_id).with_context(|| {
            format!(
                "speaker_id {} out of range ({} speakers in {})",
                speaker_id,
                table.nrows(),
                self.path.display()
            )
        })?;
        debug!(speaker_id, speakers = table.nrows(), "speaker embedding selected");
        Ok(row.to_vec())
    }

    fn read_table(&self) -> Result<NpyArray> {
        let is_npz = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("npz"));
        if !is_npz {
            return load_npy(&self.path);
        }

        let mut arrays = load_npz(&self.path)?;
        let key = NPZ_KEYS
            .iter()
            .find(|k| arrays.contains_key(**k))
            .map(|k| k.to_string())
            .or_else(|| arrays.keys().next().cloned())
            .with_context(|| format!("NPZ archive is empty: {}", self.path.display()))?;
        arrays
            .remove(&key)
            .with_context(|| format!("missing array '{key}' in {}", self.path.display()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::npz::tests::make_npy;

    #[test]
    fn test_missing_file_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.npy");
        let src = EmbeddingSource::new(path, 512, MissingEmbeddings::ZeroFill);
        let v = src.resolve(3).unwrap();
        assert_eq!(v.len(), 512);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_missing_file_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.npy");
        let src = EmbeddingSource::new(path, 512, MissingEmbeddings::Error);
        assert!(src.resolve(0).is_err());
    }

    #[test]
    fn test_revision_follows_file_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spk.npy");
        let src = EmbeddingSource::new(&path, 4, MissingEmbeddings::ZeroFill);
        assert_eq!(src.revision(), 0);

        std::fs::write(&path, make_npy(&[1, 4], &[0.0; 4])).unwrap();
        let first = src.revision();
        assert_ne!(first, 0);
        assert_eq!(src.revision(), first);

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(UNIX_EPOCH + std::time::Duration::from_secs(1_000_000))
            .unwrap();
        assert_ne!(src.revision(), first);
        assert_eq!(src.revision(), 1_000_000_000_000_000);
    }

    #[test]
    fn test_selects_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spk.npy");
        let values: Vec<f32> = (0..12).map(|x| x as f32).collect();
        std::fs::write(&path, make_npy(&[3, 4], &values)).unwrap();

        let src = EmbeddingSource::new(&path, 4, MissingEmbeddings::ZeroFill);
        assert_eq!(src.resolve(0).unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(src.resolve(2).unwrap(), vec![8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_out_of_range_speaker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spk.npy");
        std::fs::write(&path, make_npy(&[2, 4], &[0.0; 8])).unwrap();

        let src = EmbeddingSource::new(&path, 4, MissingEmbeddings::ZeroFill);
        let err = src.resolve(2).unwrap_err();
        assert!(format!("{err:#}").contains("out of range"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spk.npy");
        std::fs::write(&path, make_npy(&[2, 4], &[0.0; 8])).unwrap();

        let src = EmbeddingSource::new(&path, 512, MissingEmbeddings::ZeroFill);
        assert!(src.resolve(0).is_err());
    }

    #[test]
    fn test_npz_prefers_known_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spk.npz");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let opts = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("aaa.npy", opts).unwrap();
        zip.write_all(&make_npy(&[1, 2], &[9.0, 9.0])).unwrap();
        zip.start_file("embeddings.npy", opts).unwrap();
        zip.write_all(&make_npy(&[1, 2], &[1.0, 2.0])).unwrap();
        zip.finish().unwrap();

        let src = EmbeddingSource::new(&path, 2, MissingEmbeddings::Error);
        assert_eq!(src.resolve(0).unwrap(), vec![1.0, 2.0]);
    }
}
