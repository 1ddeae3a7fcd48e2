//! Query response cache.
//!
//! Answers are cached for a fixed time-to-live, keyed by the normalized
//! query, `top_k` and repository filter. Expired entries are evicted
//! lazily; when the cache is full the oldest entry goes first. Every entry
//! shares one TTL, so insertion order is also expiry order and both kinds
//! of eviction pop from the front of one queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::engine::QueryResponse;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    response: QueryResponse,
    repository: Option<String>,
    inserted: Instant,
    seq: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order with their insertion sequence number. A key
    /// re-inserted or removed leaves a stale slot behind.
    order: VecDeque<(String, u64)>,
    next_seq: u64,
    hits: u64,
    misses: u64,
}

pub struct QueryCache {
    ttl: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
}

/// Cache key: SHA-256 over the whitespace-normalized, lower-cased query,
/// `top_k` and repository.
pub fn cache_key(query: &str, top_k: usize, repository: Option<&str>) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(top_k.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(repository.unwrap_or("*").as_bytes());
    hex::encode(hasher.finalize())
}

impl QueryCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<QueryResponse> {
        let mut state = self.lock();
        let fresh = state
            .entries
            .get(key)
            .filter(|entry| entry.inserted.elapsed() < self.ttl)
            .map(|entry| entry.response.clone());
        match fresh {
            Some(_) => state.hits += 1,
            None => {
                state.entries.remove(key);
                state.misses += 1;
            }
        }
        fresh
    }

    pub fn insert(&self, key: String, repository: Option<&str>, response: QueryResponse) {
        let mut state = self.lock();
        let replacing = state.entries.contains_key(&key);

        while let Some((front, seq)) = state.order.front() {
            let entry = state.entries.get(front).filter(|e| e.seq == *seq);
            let live = entry.is_some();
            let expired = entry.is_some_and(|e| e.inserted.elapsed() >= self.ttl);
            let full = !replacing && state.entries.len() >= self.capacity;
            if live && !expired && !full {
                break;
            }
            if let Some((front, _)) = state.order.pop_front() {
                if live {
                    state.entries.remove(&front);
                }
            }
        }

        if state.order.len() >= 2 * self.capacity {
            let CacheState { entries, order, .. } = &mut *state;
            order.retain(|(key, seq)| entries.get(key).is_some_and(|e| e.seq == *seq));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.push_back((key.clone(), seq));
        state.entries.insert(
            key,
            CacheEntry {
                response,
                repository: repository.map(str::to_string),
                inserted: Instant::now(),
                seq,
            },
        );
    }

    /// Drop every entry scoped to `repository`, plus unscoped entries that
    /// may have drawn from it.
    pub fn invalidate_repository(&self, repository: &str) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| e.repository.as_deref().is_some_and(|r| r != repository));
        let removed = before - state.entries.len();
        let CacheState { entries, order, .. } = &mut *state;
        order.retain(|(key, seq)| entries.get(key).is_some_and(|e| e.seq == *seq));
        debug!(repository, removed, "Invalidated cached answers");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::QueryMetadata;

    fn response(answer: &str) -> QueryResponse {
        QueryResponse {
            answer: answer.to_string(),
            sources: Vec::new(),
            metadata: QueryMetadata::default(),
        }
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(
            cache_key("  Where is   MAIN? ", 5, None),
            cache_key("where is main?", 5, None)
        );
        assert_ne!(cache_key("q", 5, None), cache_key("q", 6, None));
        assert_ne!(cache_key("q", 5, None), cache_key("q", 5, Some("demo")));
        assert_eq!(cache_key("q", 5, None).len(), 64);
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = QueryCache::new(Duration::from_secs(60), 4);
        assert!(cache.get("k").is_none());
        cache.insert("k".into(), None, response("a"));
        assert_eq!(cache.get("k").unwrap().answer, "a");
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 1
            }
        );
    }

    #[test]
    fn test_expired_entries_are_evicted() {
        let cache = QueryCache::new(Duration::ZERO, 4);
        cache.insert("k".into(), None, response("a"));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        cache.insert("a".into(), None, response("a"));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".into(), None, response("b"));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c".into(), None, response("c"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_reinserted_key_counts_as_newest() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        cache.insert("a".into(), None, response("a1"));
        cache.insert("b".into(), None, response("b"));
        cache.insert("a".into(), None, response("a2"));
        assert_eq!(cache.stats().entries, 2);

        cache.insert("c".into(), None, response("c"));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().answer, "a2");
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_eviction_queue_stays_bounded() {
        let cache = QueryCache::new(Duration::from_secs(60), 3);
        for round in 0..50 {
            for key in ["x", "y", "z", "w"] {
                cache.insert(key.into(), None, response(&format!("{key}{round}")));
            }
        }
        assert_eq!(cache.stats().entries, 3);
        assert!(cache.lock().order.len() <= 3 + 1);
        assert!(cache.get("x").is_none());
        assert_eq!(cache.get("w").unwrap().answer, "w49");
    }

    #[test]
    fn test_hot_key_does_not_grow_queue() {
        let cache = QueryCache::new(Duration::from_secs(60), 4);
        cache.insert("cold".into(), None, response("cold"));
        for i in 0..100 {
            cache.insert("hot".into(), None, response(&i.to_string()));
        }
        assert!(cache.lock().order.len() <= 2 * 4 + 1);
        assert_eq!(cache.get("hot").unwrap().answer, "99");
        assert!(cache.get("cold").is_some());
    }

    #[test]
    fn test_invalidate_repository() {
        let cache = QueryCache::new(Duration::from_secs(60), 8);
        cache.insert("alpha".into(), Some("alpha"), response("1"));
        cache.insert("beta".into(), Some("beta"), response("2"));
        cache.insert("any".into(), None, response("3"));
        assert_eq!(cache.invalidate_repository("alpha"), 2);
        assert!(cache.get("beta").is_some());
        assert!(cache.get("alpha").is_none());
        assert!(cache.get("any").is_none());
    }
}
