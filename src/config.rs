//! Application configuration.
//!
//! Everything is an environment variable with a hard default so the server
//! boots with zero setup; `.env` files are honored for local development.

use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Application configuration, resolved once at boot.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the sqlite store file.
    pub store_path: String,
    /// Relational pool knobs (sqlite keeps a single writer; these bound the
    /// blocking-pool fan-out for reads).
    pub store_pool_size: usize,
    pub store_timeout: Duration,

    /// Redis endpoint for the shared L2 cache, e.g. `redis://127.0.0.1/0`.
    /// Empty disables L2 and the cache runs L1-only.
    pub kv_url: String,

    /// L1 cache entry ceiling.
    pub cache_l1_max_size: usize,
    /// Default L1 TTL when a category does not specify one.
    pub cache_default_ttl: Duration,

    /// Warm-up scheduler.
    pub warmup_hot_limit: usize,
    pub warmup_interval: Duration,
    pub warmup_industry_min_reseed: Duration,

    /// Upstream HTTP budget per call.
    pub upstream_timeout: Duration,
    /// WebSocket send budget per frame.
    pub ws_send_timeout: Duration,
    /// Sessions with no inbound activity beyond this are swept.
    pub ws_idle_timeout: Duration,
    /// Interval between server heartbeat frames.
    pub ws_heartbeat_interval: Duration,

    /// Listen port for the HTTP/WS server.
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            store_path: env_string("STORE_URL", "quotewire.db"),
            store_pool_size: env_parse("STORE_POOL_SIZE", 8usize),
            store_timeout: Duration::from_secs(env_parse("STORE_POOL_TIMEOUT_S", 10u64)),
            kv_url: env_string("KV_URL", "redis://127.0.0.1:6379/0"),
            cache_l1_max_size: env_parse("CACHE_L1_MAX_SIZE", 1000usize),
            cache_default_ttl: Duration::from_secs(env_parse("CACHE_DEFAULT_TTL_S", 300u64)),
            warmup_hot_limit: env_parse("WARMUP_HOT_LIMIT", 100usize),
            warmup_interval: Duration::from_secs(env_parse("WARMUP_INTERVAL_S", 3600u64)),
            warmup_industry_min_reseed: Duration::from_secs(
                env_parse("WARMUP_INDUSTRY_MIN_RESEED_H", 12u64) * 3600,
            ),
            upstream_timeout: Duration::from_secs(env_parse("UPSTREAM_TIMEOUT_S", 30u64)),
            ws_send_timeout: Duration::from_secs(env_parse("WS_SEND_TIMEOUT_S", 5u64)),
            ws_idle_timeout: Duration::from_secs(env_parse("WS_IDLE_TIMEOUT_S", 300u64)),
            ws_heartbeat_interval: Duration::from_secs(env_parse("WS_HEARTBEAT_S", 30u64)),
            port: env_parse("PORT", 3000u16),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::from_env();
        assert!(cfg.cache_l1_max_size > 0);
        assert!(cfg.warmup_interval >= Duration::from_secs(60));
        assert_eq!(cfg.ws_heartbeat_interval, Duration::from_secs(30));
    }
}
