//! Read-through / write-through policy across L1 and L2.
//!
//! Invariant: an L1 entry never outlives its L2 counterpart. Promotion from
//! L2 uses a shortened TTL and writes clamp the L1 TTL to the L2 TTL. When
//! L2 is unreachable, writes land in L1 only and are flagged so they cannot
//! later be promoted past their in-process lifetime.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::keys;
use crate::cache::memory::MemoryCache;
use crate::cache::redis_l2::RedisCache;
use crate::errors::FetchError;

/// Cap for promotion TTLs: `min(l2_ttl / 4, 300s)`.
const PROMOTION_TTL_CAP: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct MultiLevelCache {
    l1: Arc<MemoryCache>,
    l2: Arc<RedisCache>,
}

impl MultiLevelCache {
    pub fn new(l1: Arc<MemoryCache>, l2: Arc<RedisCache>) -> Self {
        Self { l1, l2 }
    }

    pub fn l1(&self) -> &Arc<MemoryCache> {
        &self.l1
    }

    pub fn l2(&self) -> &Arc<RedisCache> {
        &self.l2
    }

    /// L1 → L2 read path with promotion on an L2 hit.
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(hit) = self.l1.get(key) {
            return Some(hit);
        }

        match self.l2.get(key).await {
            Ok(Some(value)) => {
                let promo_ttl = match self.l2.ttl(key).await {
                    Ok(Some(remaining)) => (remaining / 4).min(PROMOTION_TTL_CAP),
                    _ => PROMOTION_TTL_CAP,
                };
                self.l1.set(key, value.clone(), Some(promo_ttl));
                Some(value)
            }
            Ok(None) => None,
            Err(FetchError::CacheUnavailable(e)) => {
                debug!(key, error = %e, "L2 unreachable on read, falling through");
                None
            }
            Err(_) => None,
        }
    }

    /// Write L2 first, then L1. Reports success only when both landed; when
    /// L2 is down the value is kept best-effort in L1 and flagged.
    pub async fn set(
        &self,
        key: &str,
        value: String,
        l2_ttl: Duration,
        l1_ttl: Option<Duration>,
    ) -> bool {
        // L1 must never outlive L2.
        let l1_ttl = l1_ttl.unwrap_or(l2_ttl).min(l2_ttl);

        match self.l2.set_ex(key, &value, l2_ttl).await {
            Ok(()) => {
                self.l1.set(key, value, Some(l1_ttl));
                true
            }
            Err(e) => {
                debug!(key, error = %e, "L2 write failed, keeping L1-only entry");
                self.l1.set_l1_only(key, value, Some(l1_ttl));
                false
            }
        }
    }

    /// Remove from both levels.
    pub async fn delete(&self, key: &str) -> bool {
        let l1_removed = self.l1.delete(key);
        let l2_removed = self.l2.delete(key).await.unwrap_or(false);
        l1_removed || l2_removed
    }

    /// Glob invalidation: SCAN-driven in L2, prefix sweep in L1.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let l1_count = self.l1.invalidate_prefix(keys::glob_prefix(pattern));
        let l2_count = self.l2.delete_pattern(pattern).await.unwrap_or(0);
        l1_count.max(l2_count)
    }
}
