//! Shared L2 cache over Redis.
//!
//! Values are JSON strings and every write carries an explicit TTL. The
//! connection is a multiplexed `ConnectionManager`; when Redis is down the
//! cache reports [`FetchError::CacheUnavailable`] and callers degrade to an
//! L1-only or bypass path instead of failing the request.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::FetchError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SCAN_BATCH: usize = 200;

/// Async Redis cache handle. Cheap to share behind an `Arc`.
pub struct RedisCache {
    conn: RwLock<Option<ConnectionManager>>,
    url: String,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Create a disconnected handle; call [`connect`](Self::connect) at boot.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            conn: RwLock::new(None),
            url: url.into(),
        }
    }

    /// A handle that never connects; used when L2 is disabled by config.
    pub fn disabled() -> Self {
        Self::new(String::new())
    }

    /// Establish the managed connection. Failure is logged, not fatal; the
    /// process serves from L1 and the store until Redis comes back.
    pub async fn connect(&self) {
        if self.url.is_empty() {
            info!("L2 cache disabled (no KV_URL)");
            return;
        }
        let client = match redis::Client::open(self.url.as_str()) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "invalid redis url, L2 cache disabled");
                return;
            }
        };
        match tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => {
                info!("connected to L2 cache");
                *self.conn.write().await = Some(conn);
            }
            Ok(Err(e)) => warn!(error = %e, "failed to connect to L2 cache"),
            Err(_) => warn!("timed out connecting to L2 cache"),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    async fn manager(&self) -> Result<ConnectionManager, FetchError> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| FetchError::CacheUnavailable("redis not connected".into()))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, FetchError> {
        let mut conn = self.manager().await?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| FetchError::CacheUnavailable(e.to_string()))
    }

    /// Set with an explicit TTL. All L2 writes expire.
    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), FetchError> {
        let mut conn = self.manager().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| FetchError::CacheUnavailable(e.to_string()))
    }

    /// Remaining TTL for a key, if it exists and has one.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, FetchError> {
        let mut conn = self.manager().await?;
        let secs: i64 = conn
            .ttl(key)
            .await
            .map_err(|e| FetchError::CacheUnavailable(e.to_string()))?;
        Ok((secs > 0).then(|| Duration::from_secs(secs as u64)))
    }

    pub async fn delete(&self, key: &str) -> Result<bool, FetchError> {
        let mut conn = self.manager().await?;
        let n: u64 = conn
            .del(key)
            .await
            .map_err(|e| FetchError::CacheUnavailable(e.to_string()))?;
        Ok(n > 0)
    }

    /// Delete every key matching a glob pattern via SCAN; never KEYS.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<usize, FetchError> {
        let mut conn = self.manager().await?;
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let scan: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| FetchError::CacheUnavailable(e.to_string()))?;
            let (next, keys) = scan;

            if !keys.is_empty() {
                let n: u64 = conn
                    .del(&keys)
                    .await
                    .map_err(|e| FetchError::CacheUnavailable(e.to_string()))?;
                deleted += n as usize;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }

    pub async fn ping(&self) -> bool {
        let Ok(mut conn) = self.manager().await else {
            return false;
        };
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}
