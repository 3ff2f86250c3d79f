//! On-disk cache of encoded audio.
//!
//! Entries are keyed by a SHA-256 over everything that changes the output
//! (model, voice data revision, speaker, container, text) and named
//! `{id}.{ext}` where `id` is the first 64 bits of the digest in hex.  An entry
//! older than the TTL is treated as a miss and removed.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::audio::AudioFormat;

/// Hex digits in a file id.
pub const FILE_ID_LEN: usize = 16;

/// Everything that identifies one synthesized clip.
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub model: &'a str,
    /// Changes when the model's voice data changes on disk.
    pub voice_revision: u64,
    pub speaker_id: usize,
    pub format: AudioFormat,
    pub text: &'a str,
}

impl CacheKey<'_> {
    /// [`FILE_ID_LEN`] lowercase hex chars.
    pub fn file_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update(b"|voice:");
        hasher.update(self.voice_revision.to_le_bytes());
        hasher.update(b"|speaker:");
        hasher.update(self.speaker_id.to_le_bytes());
        hasher.update(b"|format:");
        hasher.update(self.format.extension().as_bytes());
        hasher.update(b"|text:");
        hasher.update(self.text.as_bytes());
        let digest = hasher.finalize();
        digest[..FILE_ID_LEN / 2]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Split a served file name like `0123456789abcdef.wav` into id and format.
///
/// Anything else (other lengths, upper-case hex, separators, unknown
/// extensions) is rejected, so the result is always a plain name inside the
/// cache directory.
pub fn parse_file_name(name: &str) -> Option<(&str, AudioFormat)> {
    let (id, ext) = name.split_once('.')?;
    let lower_hex = |b: u8| matches!(b, b'0'..=b'9' | b'a'..=b'f');
    if id.len() != FILE_ID_LEN || !id.bytes().all(lower_hex) {
        return None;
    }
    let format = match ext {
        "wav" => AudioFormat::Wav,
        "mp3" => AudioFormat::Mp3,
        "flac" => AudioFormat::Flac,
        _ => return None,
    };
    Some((id, format))
}

pub struct AudioCache {
    dir: PathBuf,
    ttl: Duration,
}

impl AudioCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create cache directory: {}", dir.display()))?;
        info!(dir = %dir.display(), ttl_secs = ttl.as_secs(), "audio cache ready");
        Ok(Self { dir, ttl })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, file_id: &str, format: AudioFormat) -> PathBuf {
        self.dir.join(format!("{file_id}.{}", format.extension()))
    }

    fn is_expired(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(true, |age| age >= self.ttl)
    }

    /// Cached bytes for `key`, if present and fresh.
    pub fn get(&self, key: &CacheKey<'_>) -> Option<Vec<u8>> {
        self.get_by_id(&key.file_id(), key.format)
    }

    /// Cached bytes for a file id previously returned by [`put`](Self::put).
    pub fn get_by_id(&self, file_id: &str, format: AudioFormat) -> Option<Vec<u8>> {
        let path = self.path_for(file_id, format);
        if !path.exists() {
            return None;
        }
        if self.is_expired(&path) {
            debug!(file = %path.display(), "cache entry expired");
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "cannot remove expired cache entry");
            }
            return None;
        }
        match fs::read(&path) {
            Ok(bytes) => {
                debug!(file = %path.display(), bytes = bytes.len(), "cache hit");
                Some(bytes)
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "cannot read cache entry");
                None
            }
        }
    }

    /// Store `bytes` under `key`; returns the file id.
    ///
    /// The entry is written to a temporary file in the cache directory and
    /// renamed into place, so readers only ever see complete files.
    pub fn put(&self, key: &CacheKey<'_>, bytes: &[u8]) -> Result<String> {
        let file_id = key.file_id();
        let path = self.path_for(&file_id, key.format);

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("cannot create temp file in {}", self.dir.display()))?;
        tmp.write_all(bytes).context("cannot write cache entry")?;
        tmp.persist(&path)
            .with_context(|| format!("cannot move cache entry into {}", path.display()))?;

        debug!(file = %path.display(), bytes = bytes.len(), "cached");
        Ok(file_id)
    }

    /// Delete every expired entry; returns how many were removed.
    pub fn cleanup(&self) -> Result<usize> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("cannot read cache directory: {}", self.dir.display()))?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !self.is_expired(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %path.display(), error = %e, "cannot remove cache entry"),
            }
        }
        if removed > 0 {
            info!(removed, "expired cache entries removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn key(text: &str) -> CacheKey<'_> {
        CacheKey {
            model: "speecht5",
            voice_revision: 0,
            speaker_id: 0,
            format: AudioFormat::Wav,
            text,
        }
    }

    #[test]
    fn test_file_id_is_stable_and_short() {
        let a = key("Hello, world!").file_id();
        assert_eq!(a, key("Hello, world!").file_id());
        assert_eq!(a.len(), FILE_ID_LEN);
        assert!(parse_file_name(&format!("{a}.wav")).is_some());
        assert_ne!(a, key("Different text").file_id());
    }

    #[test]
    fn test_every_field_changes_the_id() {
        let base = key("hi");
        let other_speaker = CacheKey {
            speaker_id: 1,
            ..base
        };
        let other_format = CacheKey {
            format: AudioFormat::Mp3,
            ..base
        };
        let other_model = CacheKey {
            model: "cosyvoice",
            ..base
        };
        let other_voice = CacheKey {
            voice_revision: 42,
            ..base
        };
        for k in [other_speaker, other_format, other_model, other_voice] {
            assert_ne!(base.file_id(), k.file_id());
        }
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("0123456789abcdef.mp3"),
            Some(("0123456789abcdef", AudioFormat::Mp3))
        );
        for bad in [
            "0123456789abcdef",
            "0123456789abcdef.ogg",
            "0123456789ABCDEF.wav",
            "0123456789abcde.wav",
            "../../etc/passwd",
            "..%2f0123456789ab.wav",
            "0123456789abcdef.wav.wav",
            "0123456789abcdef.wav/x",
        ] {
            assert_eq!(parse_file_name(bad), None, "{bad}");
        }
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path().join("audio"), Duration::from_secs(3600)).unwrap();
        assert!(cache.get(&key("x")).is_none());

        let id = cache.put(&key("x"), b"RIFFdata").unwrap();
        assert!(cache.dir().join(format!("{id}.wav")).exists());
        assert_eq!(cache.get(&key("x")).as_deref(), Some(&b"RIFFdata"[..]));
        assert_eq!(
            cache.get_by_id(&id, AudioFormat::Wav).as_deref(),
            Some(&b"RIFFdata"[..])
        );
        assert!(cache.get_by_id(&id, AudioFormat::Mp3).is_none());
    }

    #[test]
    fn test_put_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
        cache.put(&key("x"), b"first").unwrap();
        cache.put(&key("x"), b"second, longer").unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(cache.get(&key("x")).as_deref(), Some(&b"second, longer"[..]));
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(AudioCache::new(dir.path(), Duration::from_secs(3600)).unwrap());
        let small = vec![1u8; 16];
        let large = vec![2u8; 1 << 20];
        cache.put(&key("race"), &small).unwrap();

        let writer = {
            let cache = cache.clone();
            let (small, large) = (small.clone(), large.clone());
            thread::spawn(move || {
                for i in 0..20 {
                    let bytes = if i % 2 == 0 { &large } else { &small };
                    cache.put(&key("race"), bytes).unwrap();
                }
            })
        };
        for _ in 0..200 {
            if let Some(bytes) = cache.get(&key("race")) {
                assert!(bytes == small || bytes == large, "partial read of {} bytes", bytes.len());
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path(), Duration::ZERO).unwrap();
        cache.put(&key("x"), b"data").unwrap();
        assert!(cache.get(&key("x")).is_none());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path(), Duration::ZERO).unwrap();
        cache.put(&key("a"), b"1").unwrap();
        cache.put(&key("b"), b"2").unwrap();
        assert_eq!(cache.cleanup().unwrap(), 2);

        let fresh = AudioCache::new(dir.path(), Duration::from_secs(3600)).unwrap();
        fresh.put(&key("c"), b"3").unwrap();
        assert_eq!(fresh.cleanup().unwrap(), 0);
    }
}
