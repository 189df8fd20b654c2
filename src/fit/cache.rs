//! Content-addressed artifact cache
//!
//! A pure performance optimization: repeated fits with an identical
//! (specification, dataset, sampling configuration) triple reuse the
//! previous artifact instead of resampling. The key is a content hash of
//! all three fingerprints, so a change to any component misses the cache —
//! a stale artifact can never be returned for different inputs.

use super::FittedArtifact;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// In-memory artifact cache keyed by content fingerprint.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    entries: DashMap<u64, Arc<FittedArtifact>, rustc_hash::FxBuildHasher>,
}

impl ArtifactCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine spec, data and config fingerprints into one cache key.
    #[must_use]
    pub fn key(spec_fingerprint: u64, data_fingerprint: u64, config_fingerprint: u64) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        spec_fingerprint.hash(&mut hasher);
        data_fingerprint.hash(&mut hasher);
        config_fingerprint.hash(&mut hasher);
        hasher.finish()
    }

    /// Look up an artifact by key.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<Arc<FittedArtifact>> {
        self.entries.get(&key).map(|entry| Arc::clone(&entry))
    }

    /// Store an artifact under a key, overwriting any previous entry.
    pub fn put(&self, key: u64, artifact: Arc<FittedArtifact>) {
        self.entries.insert(key, artifact);
    }

    /// Number of cached artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no artifacts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached artifact.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
