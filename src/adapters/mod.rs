//! Upstream source adapters.
//!
//! One adapter per market, all normalizing into the canonical row shape.
//! Adapters are chosen by market type through [`AdapterRegistry`]; nothing
//! outside this module knows which vendor backs which market.

pub mod a_share;
pub mod crypto;
pub mod futures_mkt;
pub mod normalize;
pub mod us_stock;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::AdapterError;
use crate::models::{
    AnnualEarnings, CorporateAction, FundamentalSnapshot, Interval, Market, OhlcvRow, SpotQuote,
};
use crate::symbols::Symbol;

/// Inclusive date bounds for a history request. `None` means "as much as
/// the source will give us".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn bounded(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }
}

/// Contract every upstream source implements.
///
/// Output guarantees: rows sorted ascending by trade date, dates
/// canonicalized, derived columns filled per `normalize::finalize_rows`.
/// Empty results are `Ok(vec![])`, never an error.
#[async_trait]
pub trait MarketAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn market(&self) -> Market;

    /// Intervals this source can serve, advertised statically.
    fn supported_intervals(&self) -> &'static [Interval];

    async fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        interval: Interval,
        range: DateRange,
    ) -> Result<Vec<OhlcvRow>, AdapterError>;

    async fn fetch_fundamentals(
        &self,
        symbol: &Symbol,
    ) -> Result<Option<FundamentalSnapshot>, AdapterError>;

    /// Dividend/split history; empty where the source has none.
    async fn fetch_corporate_actions(
        &self,
        _symbol: &Symbol,
    ) -> Result<Vec<CorporateAction>, AdapterError> {
        Ok(Vec::new())
    }

    /// Annual net profit history; empty where the source has none.
    async fn fetch_annual_earnings(
        &self,
        _symbol: &Symbol,
    ) -> Result<Vec<AnnualEarnings>, AdapterError> {
        Ok(Vec::new())
    }

    /// One batched spot call covering many symbols, where the source
    /// supports it. `Ok(None)` means "no batch endpoint, fall back to
    /// per-symbol fetches".
    async fn fetch_spot_batch(
        &self,
        _symbols: &[String],
    ) -> Result<Option<Vec<SpotQuote>>, AdapterError> {
        Ok(None)
    }

    /// Full symbol roster `(code, name)` for list bootstrap, where exposed.
    async fn fetch_symbol_list(&self) -> Result<Vec<(String, String)>, AdapterError> {
        Ok(Vec::new())
    }
}

/// Shared HTTP client shaped for upstream calls.
pub fn upstream_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("Mozilla/5.0 (X11; Linux x86_64) quotewire/0.1")
        .build()
        .unwrap_or_default()
}

/// Classify an HTTP status into the adapter failure taxonomy.
pub(crate) fn classify_status(resp: &reqwest::Response) -> Option<AdapterError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Some(AdapterError::Throttled { retry_after });
    }
    if status.is_server_error() {
        return Some(AdapterError::Transport(format!("upstream {status}")));
    }
    if !status.is_success() {
        return Some(AdapterError::Malformed(format!("unexpected status {status}")));
    }
    None
}

/// Market → adapter lookup, built once at boot.
pub struct AdapterRegistry {
    adapters: HashMap<Market, Arc<dyn MarketAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("markets", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with every production adapter wired to one HTTP client.
    pub fn with_defaults(timeout: Duration) -> Self {
        let http = upstream_http_client(timeout);
        let mut registry = Self::new();
        registry.register(Arc::new(a_share::AShareAdapter::new(http.clone())));
        registry.register(Arc::new(us_stock::UsStockAdapter::new(http.clone())));
        registry.register(Arc::new(crypto::CryptoAdapter::new(http.clone())));
        registry.register(Arc::new(futures_mkt::FuturesAdapter::new(http)));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn MarketAdapter>) {
        self.adapters.insert(adapter.market(), adapter);
    }

    pub fn for_market(&self, market: Market) -> Option<Arc<dyn MarketAdapter>> {
        self.adapters.get(&market).cloned()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_routes_by_market() {
        let registry = AdapterRegistry::with_defaults(Duration::from_secs(5));
        for market in [Market::AShare, Market::UsStock, Market::Crypto, Market::Futures] {
            let adapter = registry.for_market(market).expect("adapter registered");
            assert_eq!(adapter.market(), market);
        }
        assert!(registry.for_market(Market::HkStock).is_none());
    }
}
