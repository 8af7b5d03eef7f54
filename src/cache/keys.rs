//! Cache key scheme.
//!
//! Key = `<prefix>:<identifier>[:<date>][:<market>]:<version>`. The version
//! suffix gates breaking payload-schema changes. The parametric form hashes
//! a canonicalized parameter map and inserts the first 8 hex digits of the
//! digest between identifier and version.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const KEY_VERSION: &str = "v1";

/// Recognized key prefixes.
pub mod prefix {
    pub const STOCK_INFO: &str = "stock:info";
    pub const STOCK_DAILY: &str = "stock:daily";
    pub const STOCK_METRICS: &str = "stock:metrics";
    pub const FILTER_RESULT: &str = "filter:result";
    pub const SYSTEM_CONFIG: &str = "system:config";
    pub const USER_SESSION: &str = "user:session";
    pub const API_CACHE: &str = "api:cache";
    pub const MARKET_METRICS: &str = "market:metrics";
    pub const FUNDAMENTAL_DATA: &str = "fundamental:data";
}

/// Build a plain key: `prefix:identifier[:date][:market]:v1`.
pub fn build(
    prefix: &str,
    identifier: &str,
    date: Option<&str>,
    market: Option<&str>,
) -> String {
    let mut key = String::with_capacity(64);
    key.push_str(prefix);
    key.push(':');
    key.push_str(identifier);
    if let Some(d) = date {
        key.push(':');
        key.push_str(d);
    }
    if let Some(m) = market {
        key.push(':');
        key.push_str(m);
    }
    key.push(':');
    key.push_str(KEY_VERSION);
    key
}

/// Build a parametric key: `prefix:identifier:<hash8>:v1`.
///
/// Parameters are canonicalized by sorted key order before hashing so the
/// same logical query always lands on the same cache entry.
pub fn build_params(prefix: &str, identifier: &str, params: &BTreeMap<&str, String>) -> String {
    let canonical = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{prefix}:{identifier}:{}:{KEY_VERSION}", &digest[..8])
}

/// Reduce a glob pattern to its literal prefix for the L1 sweep.
///
/// `stock:daily:000001.SZ:*` → `stock:daily:000001.SZ:`.
pub fn glob_prefix(pattern: &str) -> &str {
    match pattern.find(['*', '?', '[']) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}
