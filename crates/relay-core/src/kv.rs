//! Per-request KV-cache bookkeeping: prefix token accounting and
//! inter-device handoff counters along a shard chain.
//!
//! Accessed only from the engine's single worker thread; `stats()` may
//! be read from transport threads, so the counters live behind a
//! short-held mutex rather than bare fields.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct KVCacheStats {
    pub cached_tokens: u64,
    pub resident_bytes: u64,
    pub handoffs: u64,
    pub offloads: u64,
}

#[derive(Default)]
struct Inner {
    stats: KVCacheStats,
    prefix_tokens: HashMap<String, u64>,
}

pub struct KvCacheManager {
    inner: Mutex<Inner>,
}

impl KvCacheManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Overwrite semantics on duplicate id: replace, adjusting
    /// `cached_tokens` by the delta rather than double-counting.
    pub fn seed_prefix(&self, request_id: &str, tokens: u64) {
        let mut g = self.inner.lock().unwrap();
        let previous = g.prefix_tokens.insert(request_id.to_string(), tokens);
        if let Some(previous) = previous {
            g.stats.cached_tokens = g.stats.cached_tokens.saturating_sub(previous);
        }
        g.stats.cached_tokens += tokens;
    }

    /// No-op on an unknown id.
    pub fn handoff(&self, request_id: &str, _from_label: &str, _to_label: &str) {
        let mut g = self.inner.lock().unwrap();
        if g.prefix_tokens.contains_key(request_id) {
            g.stats.handoffs += 1;
            g.stats.offloads += 1;
        }
    }

    /// Dropping an absent id is a no-op returning 0.
    pub fn drop_request(&self, request_id: &str) -> u64 {
        let mut g = self.inner.lock().unwrap();
        let removed = g.prefix_tokens.remove(request_id).unwrap_or(0);
        g.stats.cached_tokens = g.stats.cached_tokens.saturating_sub(removed);
        removed
    }

    pub fn stats(&self) -> KVCacheStats {
        self.inner.lock().unwrap().stats
    }
}

impl Default for KvCacheManager {
    fn default() -> Self {
        Self::new()
    }
}
