//! In-memory cache of synthesized segments
//!
//! Keyed by a hash of the segment text and voice settings. Hits bypass the
//! backend pool entirely and are not counted in utilization stats.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use xxhash_rust::xxh3::xxh3_128;

use crate::core::engine::{SynthesizedAudio, VoiceSettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum cached segments
    pub capacity: u64,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 1024,
            ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

pub struct SegmentCache {
    entries: Cache<u128, Arc<SynthesizedAudio>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Stable cache key for one segment rendering
pub fn segment_key(text: &str, voice: &VoiceSettings) -> u128 {
    let mut s = String::with_capacity(text.len() + voice.voice.len() + 24);
    s.push_str(text);
    s.push('|');
    s.push_str(&voice.voice);
    s.push('|');
    s.push_str(&voice.lang);
    s.push('|');
    s.push_str(&format!("{:.3}", voice.speed));
    xxh3_128(s.as_bytes())
}

impl SegmentCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(Duration::from_secs(config.ttl_secs))
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, text: &str, voice: &VoiceSettings) -> Option<Arc<SynthesizedAudio>> {
        let found = self.entries.get(&segment_key(text, voice)).await;
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub async fn insert(&self, text: &str, voice: &VoiceSettings, audio: Arc<SynthesizedAudio>) {
        self.entries.insert(segment_key(text, voice), audio).await;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
        }
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}
