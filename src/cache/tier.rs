//! Single in-memory cache tier with TTL and one eviction policy

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache eviction policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least Recently Used
    Lru,
    /// First In, First Out
    Fifo,
    /// Least Frequently Used
    Lfu,
}

/// One cached row
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Vec<u8>,
    pub content_type: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub size_bytes: usize,
}

impl CacheEntry {
    pub fn new(body: Vec<u8>, content_type: impl Into<String>, ttl: Duration) -> Self {
        let now = Instant::now();
        let size_bytes = body.len();
        Self {
            body,
            content_type: content_type.into(),
            created_at: now,
            // Invariant: expires_at > created_at
            expires_at: now + ttl.max(Duration::from_nanos(1)),
            last_accessed_at: now,
            access_count: 0,
            size_bytes,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Statistics for one tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// A bounded collection of entries governed by one eviction policy.
///
/// Capacity pressure is resolved by eviction, never by erroring. Callers
/// serialize access through the tier's outer lock.
#[derive(Debug)]
pub struct CacheTier {
    name: &'static str,
    policy: EvictionPolicy,
    max_size: usize,
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheTier {
    pub fn new(name: &'static str, policy: EvictionPolicy, max_size: usize) -> Self {
        Self {
            name,
            policy,
            max_size: max_size.max(1),
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fetch a live entry, updating access metadata. An entry observed past
    /// its expiry is never returned; it stays in place for stale-serve until
    /// the sweeper or eviction collects it.
    pub fn get(&mut self, key: &str) -> Option<CacheEntry> {
        match self.entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.last_accessed_at = Instant::now();
                entry.access_count += 1;
                self.hits += 1;
                Some(entry.clone())
            }
            Some(_) => {
                self.misses += 1;
                debug!(tier = self.name, key, "expired entry, deletion left to sweep");
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Fetch an entry even if expired, without touching access metadata.
    /// Used for stale-serve; never promotes and never extends TTL.
    pub fn peek_any(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).cloned()
    }

    /// Insert or overwrite. A new key at capacity evicts exactly one entry
    /// per the tier's policy first.
    pub fn put(&mut self, key: String, entry: CacheEntry) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_one();
        }
        self.entries.insert(key, entry);
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn scan_keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            size: self.entries.len(),
        }
    }

    /// Remove all expired entries, returning how many were dropped
    pub fn sweep_expired(&mut self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        let count = expired.len();
        for key in expired {
            self.entries.remove(&key);
        }
        if count > 0 {
            debug!(tier = self.name, count, "swept expired entries");
        }
        count
    }

    fn evict_one(&mut self) {
        let victim = match self.policy {
            EvictionPolicy::Lru => self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed_at)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => self
                .entries
                .iter()
                // Ties on access_count break toward the least recently used
                .min_by_key(|(_, e)| (e.access_count, e.last_accessed_at))
                .map(|(k, _)| k.clone()),
        };

        if let Some(key) = victim {
            self.entries.remove(&key);
            self.evictions += 1;
            debug!(tier = self.name, key, policy = ?self.policy, "evicted entry");
        }
    }
}
