//! On-disk LRU cache of synthesized phrases

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::Result;
use crate::voice::AudioArtifact;

/// One cached phrase
#[derive(Debug, Clone)]
pub struct AudioCacheEntry {
    /// SHA-256 of text, voice and speed
    pub key: String,
    /// Cached file
    pub artifact_path: PathBuf,
    /// Playback length
    pub duration: Duration,
    /// Last hit or insert
    pub last_used: DateTime<Utc>,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from disk
    pub hits: u64,
    /// Lookups that went to a service
    pub misses: u64,
    /// Entries dropped to stay within capacity
    pub evictions: u64,
    /// Entries currently held
    pub entries: usize,
}

/// Bounded LRU of synthesized audio, keyed by request
pub struct SynthesisCache {
    dir: PathBuf,
    entries: Mutex<LruCache<String, AudioCacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SynthesisCache {
    /// Cache storing files under `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(dir: &Path, capacity: NonZeroUsize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Cache key for a request
    #[must_use]
    pub fn key(text: &str, voice: &str, speed: f32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0]);
        hasher.update(voice.as_bytes());
        hasher.update([0]);
        hasher.update(format!("{speed:.3}").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a cached artifact, refreshing its recency
    pub async fn get(&self, key: &str) -> Option<AudioArtifact> {
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(key) else {
            drop(entries);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if !entry.artifact_path.exists() {
            tracing::debug!(key, "cached file vanished, dropping entry");
            entries.pop(key);
            drop(entries);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.last_used = Utc::now();
        let artifact = AudioArtifact::persistent(entry.artifact_path.clone(), entry.duration);
        drop(entries);

        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key, "synthesis cache hit");
        Some(artifact)
    }

    /// Copy `artifact` into the cache and return the cached copy
    ///
    /// The source file is discarded if ephemeral.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be copied
    pub async fn insert(&self, key: &str, artifact: &AudioArtifact) -> Result<AudioArtifact> {
        let extension = artifact
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("wav");
        let cached_path = self.dir.join(format!("{key}.{extension}"));

        tokio::fs::copy(&artifact.path, &cached_path).await?;
        artifact.discard();

        let entry = AudioCacheEntry {
            key: key.to_string(),
            artifact_path: cached_path.clone(),
            duration: artifact.duration,
            last_used: Utc::now(),
        };

        let evicted = self.entries.lock().await.push(key.to_string(), entry);
        if let Some((evicted_key, evicted_entry)) = evicted {
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %evicted_key, "evicting cached phrase");
                if let Err(e) = tokio::fs::remove_file(&evicted_entry.artifact_path).await {
                    tracing::debug!(error = %e, "failed to remove evicted file");
                }
            }
        }

        Ok(AudioArtifact::persistent(cached_path, artifact.duration))
    }

    /// Snapshot of all entries, most recent first
    pub async fn entries(&self) -> Vec<AudioCacheEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Counter snapshot
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.lock().await.len(),
        }
    }
}
