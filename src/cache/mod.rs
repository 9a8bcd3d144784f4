//! Three-tier cache with promotion on read and pattern invalidation
//!
//! Tiers are probed L1 → L2 → L3; a hit at a deeper tier is copied into
//! every enabled tier above it with that tier's own default TTL. Tier locks
//! are always taken in ascending order and held only for map operations.

pub mod key;
pub mod tier;

pub use key::derive_cache_key;
pub use tier::{CacheEntry, CacheTier, EvictionPolicy, TierStats};

use crate::config::{CacheSettings, TierSettings};
use crate::error::{ProxyError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A cache read result with provenance metadata
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub body: Vec<u8>,
    pub content_type: String,
    /// 1-based tier level the hit came from
    pub tier_level: usize,
    pub age: Duration,
    /// True when served past its expiry (stale-serve path only)
    pub stale: bool,
    pub size_bytes: usize,
}

struct TierHandle {
    level: usize,
    settings: TierSettings,
    tier: RwLock<CacheTier>,
}

/// Orchestrates the L1/L2/L3 tiers
pub struct TieredCache {
    tiers: Vec<TierHandle>,
}

impl TieredCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let mut tiers = Vec::new();
        let configured: [(usize, &'static str, &TierSettings); 3] = [
            (1, "l1", &settings.l1),
            (2, "l2", &settings.l2),
            (3, "l3", &settings.l3),
        ];
        for (level, name, tier_settings) in configured {
            if tier_settings.enabled {
                tiers.push(TierHandle {
                    level,
                    settings: tier_settings.clone(),
                    tier: RwLock::new(CacheTier::new(
                        name,
                        tier_settings.policy,
                        tier_settings.max_size,
                    )),
                });
            }
        }
        Self { tiers }
    }

    /// Probe tiers in order; the first live hit wins and is promoted into
    /// every enabled tier above it with that tier's configured TTL.
    pub async fn get(&self, cache_key: &str) -> Option<CacheHit> {
        let mut hit: Option<(usize, CacheEntry)> = None;

        for (idx, handle) in self.tiers.iter().enumerate() {
            let entry = {
                let mut tier = handle.tier.write().await;
                tier.get(cache_key)
            };
            if let Some(entry) = entry {
                hit = Some((idx, entry));
                break;
            }
        }

        let (idx, entry) = hit?;
        let level = self.tiers[idx].level;

        if idx > 0 {
            // Promotion never propagates backward and always resets the TTL
            // to the destination tier's default.
            for upper in &self.tiers[..idx] {
                let promoted = CacheEntry::new(
                    entry.body.clone(),
                    entry.content_type.clone(),
                    upper.settings.default_ttl(),
                );
                let mut tier = upper.tier.write().await;
                tier.put(cache_key.to_string(), promoted);
            }
            debug!(key = cache_key, from_level = level, "promoted cache entry");
        }

        Some(CacheHit {
            age: entry.age(),
            size_bytes: entry.size_bytes,
            body: entry.body,
            content_type: entry.content_type,
            tier_level: level,
            stale: false,
        })
    }

    /// Write into every enabled tier, with `explicit_ttl` overriding each
    /// tier's configured default.
    pub async fn put(
        &self,
        cache_key: &str,
        body: &[u8],
        content_type: &str,
        explicit_ttl: Option<Duration>,
    ) {
        for handle in &self.tiers {
            let ttl = explicit_ttl.unwrap_or_else(|| handle.settings.default_ttl());
            let entry = CacheEntry::new(body.to_vec(), content_type, ttl);
            let mut tier = handle.tier.write().await;
            tier.put(cache_key.to_string(), entry);
        }
    }

    /// Remove a key from every tier
    pub async fn delete(&self, cache_key: &str) -> bool {
        let mut removed = false;
        for handle in &self.tiers {
            let mut tier = handle.tier.write().await;
            removed |= tier.delete(cache_key);
        }
        removed
    }

    /// Delete every key matching the regex pattern across all tiers.
    /// Returns the count of unique keys deleted.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let regex = Regex::new(pattern)
            .map_err(|e| ProxyError::BadRequest(format!("invalid invalidation pattern: {e}")))?;

        let mut deleted: HashSet<String> = HashSet::new();
        for handle in &self.tiers {
            let matching: Vec<String> = {
                let tier = handle.tier.read().await;
                tier.scan_keys()
                    .into_iter()
                    .filter(|key| regex.is_match(key))
                    .collect()
            };
            if matching.is_empty() {
                continue;
            }
            let mut tier = handle.tier.write().await;
            for key in matching {
                if tier.delete(&key) {
                    deleted.insert(key);
                }
            }
        }

        info!(pattern, count = deleted.len(), "cache invalidation");
        Ok(deleted.len())
    }

    /// Look for any entry for the key, expired or not, without promotion
    /// and without extending its TTL. Stale-serve fallback only.
    pub async fn get_stale(&self, cache_key: &str) -> Option<CacheHit> {
        for handle in &self.tiers {
            let entry = {
                let tier = handle.tier.read().await;
                tier.peek_any(cache_key)
            };
            if let Some(entry) = entry {
                return Some(CacheHit {
                    age: entry.age(),
                    size_bytes: entry.size_bytes,
                    stale: entry.is_expired(),
                    body: entry.body,
                    content_type: entry.content_type,
                    tier_level: handle.level,
                });
            }
        }
        None
    }

    /// Drop expired entries from every tier
    pub async fn sweep(&self) -> usize {
        let mut total = 0;
        for handle in &self.tiers {
            let mut tier = handle.tier.write().await;
            total += tier.sweep_expired();
        }
        total
    }

    /// Per-tier statistics keyed by tier name
    pub async fn stats(&self) -> Vec<(String, TierStats)> {
        let mut out = Vec::with_capacity(self.tiers.len());
        for handle in &self.tiers {
            let tier = handle.tier.read().await;
            out.push((tier.name().to_string(), tier.stats()));
        }
        out
    }

    /// Spawn the periodic expired-entry sweeper
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = cache.sweep().await;
                if swept > 0 {
                    info!(swept, "cache sweep removed expired entries");
                }
            }
        });
    }
}
