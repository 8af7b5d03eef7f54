//! Multi-tier cache: in-process LRU (L1) + shared Redis (L2).
//!
//! [`CacheService`] is the facade the rest of the system talks to. It owns
//! both tiers, applies the per-category TTL strategy table and enforces
//! eager materialization: only serialized strings go in, so no pending
//! computation can ever be cached.

pub mod keys;
pub mod memory;
pub mod multi;
pub mod redis_l2;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::errors::FetchError;
use memory::{CacheStats, MemoryCache};
use multi::MultiLevelCache;
use redis_l2::RedisCache;

/// Cache category, selecting a TTL strategy and key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    SymbolInfo,
    DailyOhlcv,
    DerivedMetrics,
    ScreenerResult,
    ApiResponse,
    FundamentalData,
    MarketMetrics,
}

/// Per-category TTLs and whether the entry is worth holding in both tiers.
#[derive(Debug, Clone, Copy)]
pub struct Strategy {
    pub l2_ttl: Duration,
    pub l1_ttl: Duration,
    pub multi_level: bool,
}

impl Category {
    pub fn strategy(&self) -> Strategy {
        match self {
            Category::SymbolInfo => Strategy {
                l2_ttl: Duration::from_secs(86_400),
                l1_ttl: Duration::from_secs(3_600),
                multi_level: true,
            },
            Category::DailyOhlcv => Strategy {
                l2_ttl: Duration::from_secs(3_600),
                l1_ttl: Duration::from_secs(900),
                multi_level: false,
            },
            Category::DerivedMetrics => Strategy {
                l2_ttl: Duration::from_secs(1_800),
                l1_ttl: Duration::from_secs(300),
                multi_level: true,
            },
            Category::ScreenerResult => Strategy {
                l2_ttl: Duration::from_secs(900),
                l1_ttl: Duration::from_secs(300),
                multi_level: false,
            },
            Category::ApiResponse => Strategy {
                l2_ttl: Duration::from_secs(900),
                l1_ttl: Duration::from_secs(180),
                multi_level: true,
            },
            Category::FundamentalData => Strategy {
                l2_ttl: Duration::from_secs(3_600),
                l1_ttl: Duration::from_secs(600),
                multi_level: true,
            },
            Category::MarketMetrics => Strategy {
                l2_ttl: Duration::from_secs(1_800),
                l1_ttl: Duration::from_secs(300),
                multi_level: true,
            },
        }
    }
}

/// Facade over both cache tiers with category-driven policy.
#[derive(Debug)]
pub struct CacheService {
    multi: MultiLevelCache,
}

impl CacheService {
    pub fn new(l1: Arc<MemoryCache>, l2: Arc<RedisCache>) -> Self {
        Self {
            multi: MultiLevelCache::new(l1, l2),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let l1 = Arc::new(MemoryCache::new(cfg.cache_l1_max_size, cfg.cache_default_ttl));
        let l2 = Arc::new(RedisCache::new(cfg.kv_url.clone()));
        Self::new(l1, l2)
    }

    /// An L1-only service for tests and degraded boots.
    pub fn in_process_only(max_size: usize) -> Self {
        Self::new(
            Arc::new(MemoryCache::new(max_size, Duration::from_secs(300))),
            Arc::new(RedisCache::disabled()),
        )
    }

    pub fn l1(&self) -> &Arc<MemoryCache> {
        self.multi.l1()
    }

    pub fn l2(&self) -> &Arc<RedisCache> {
        self.multi.l2()
    }

    /// Raw read honoring the category's tier policy: multi-level categories
    /// promote L2 hits into L1, single-level ones do not.
    pub async fn get(&self, category: Category, key: &str) -> Option<String> {
        let strategy = category.strategy();
        if strategy.multi_level {
            self.multi.get(key).await
        } else {
            if let Some(hit) = self.multi.l1().get(key) {
                return Some(hit);
            }
            match self.multi.l2().get(key).await {
                Ok(v) => v,
                Err(FetchError::CacheUnavailable(_)) => None,
                Err(_) => None,
            }
        }
    }

    /// Raw write: write-through to both tiers with the category's TTLs.
    /// Returns true only when the payload reached L2; an L2 outage keeps the
    /// value best-effort in L1. The `multi_level` flag governs read
    /// promotion, not writes.
    pub async fn set(&self, category: Category, key: &str, value: String) -> bool {
        let strategy = category.strategy();
        self.multi
            .set(key, value, strategy.l2_ttl, Some(strategy.l1_ttl))
            .await
    }

    /// Typed read: deserialize a cached JSON payload.
    pub async fn get_json<T: DeserializeOwned>(&self, category: Category, key: &str) -> Option<T> {
        let raw = self.get(category, key).await?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "dropping undecodable cache entry");
                self.multi.delete(key).await;
                None
            }
        }
    }

    /// Typed write: the value is serialized eagerly, before anything is
    /// stored, so the cache only ever holds materialized payloads.
    pub async fn set_json<T: Serialize>(&self, category: Category, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(category, key, raw).await,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize cache payload");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.multi.delete(key).await
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.multi.invalidate_pattern(pattern).await
    }

    pub fn l1_stats(&self) -> CacheStats {
        self.multi.l1().stats()
    }

    /// Boot-time hook: connect L2 and start the L1 sweeper.
    pub async fn start(&self) {
        self.multi.l2().connect().await;
        self.multi.l1().spawn_sweeper(Duration::from_secs(60));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        symbol: String,
        close: f64,
    }

    #[tokio::test]
    async fn typed_round_trip_through_l1() {
        let cache = CacheService::in_process_only(16);
        let key = keys::build(keys::prefix::STOCK_INFO, "AAPL", None, None);
        let value = Payload {
            symbol: "AAPL".into(),
            close: 187.42,
        };

        cache.set_json(Category::SymbolInfo, &key, &value).await;
        let got: Payload = cache.get_json(Category::SymbolInfo, &key).await.unwrap();
        assert_eq!(got, value);
    }

    #[tokio::test]
    async fn strategy_table_matches_spec() {
        let s = Category::SymbolInfo.strategy();
        assert_eq!(s.l2_ttl, Duration::from_secs(86_400));
        assert_eq!(s.l1_ttl, Duration::from_secs(3_600));
        assert!(s.multi_level);

        let s = Category::DailyOhlcv.strategy();
        assert_eq!(s.l2_ttl, Duration::from_secs(3_600));
        assert!(!s.multi_level);

        let s = Category::ApiResponse.strategy();
        assert_eq!(s.l1_ttl, Duration::from_secs(180));
    }

    #[tokio::test]
    async fn l1_ttl_never_exceeds_l2_ttl() {
        for c in [
            Category::SymbolInfo,
            Category::DailyOhlcv,
            Category::DerivedMetrics,
            Category::ScreenerResult,
            Category::ApiResponse,
            Category::FundamentalData,
            Category::MarketMetrics,
        ] {
            let s = c.strategy();
            assert!(s.l1_ttl <= s.l2_ttl, "{c:?} violates the tier TTL invariant");
        }
    }

    #[tokio::test]
    async fn undecodable_entries_are_evicted() {
        let cache = CacheService::in_process_only(16);
        cache
            .set(Category::SymbolInfo, "stock:info:BAD:v1", "not-json".into())
            .await;
        let got: Option<Payload> = cache.get_json(Category::SymbolInfo, "stock:info:BAD:v1").await;
        assert!(got.is_none());
        assert!(cache.get(Category::SymbolInfo, "stock:info:BAD:v1").await.is_none());
    }
}
