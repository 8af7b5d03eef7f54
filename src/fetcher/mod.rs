//! Fetch coordinator: the single entry point for every data view.
//!
//! Cache-aside orchestration with per-key single-flight, market-calendar
//! freshness, capped retries and a per-symbol circuit breaker. The rest of
//! the system (HTTP handlers, warm-up scheduler, stream workers) obtains
//! data exclusively through [`DataFetcher`].

pub mod breaker;
pub mod freshness;
pub mod singleflight;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapters::normalize::recompute_mas;
use crate::adapters::{AdapterRegistry, DateRange, MarketAdapter};
use crate::cache::{keys, CacheService, Category};
use crate::errors::{AdapterError, FetchError, FetchResult};
use crate::models::{
    AnnualEarnings, CorporateAction, FundamentalSnapshot, Interval, Market, OhlcvRow, SymbolInfo,
};
use crate::quality;
use crate::store::{ScreenerQuery, Store};
use crate::symbols::{self, Symbol};
use breaker::CircuitBreaker;
use singleflight::SingleFlight;

/// Injectable time source; tests pin it, production uses `Utc::now`.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const MAX_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
/// Fundamentals stored within this window are served without an upstream hit.
const FUNDAMENTALS_MAX_AGE_HOURS: i64 = 24;
/// Symbol lists older than this trigger a refresh.
const SYMBOL_LIST_MAX_AGE_HOURS: i64 = 24;

/// Outcome of a forced symbol-list refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub refreshed: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct DataFetcher {
    store: Arc<Store>,
    cache: Arc<CacheService>,
    adapters: Arc<AdapterRegistry>,
    flights: SingleFlight<Arc<Vec<OhlcvRow>>>,
    breaker: CircuitBreaker,
    clock: Clock,
}

impl std::fmt::Debug for DataFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFetcher")
            .field("flights", &self.flights)
            .finish_non_exhaustive()
    }
}

impl DataFetcher {
    pub fn new(store: Arc<Store>, cache: Arc<CacheService>, adapters: Arc<AdapterRegistry>) -> Self {
        Self {
            store,
            cache,
            adapters,
            flights: SingleFlight::new(),
            breaker: CircuitBreaker::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Adapter lookup by market; the only place selection lives.
    pub fn adapter_for(&self, market: Market) -> FetchResult<Arc<dyn MarketAdapter>> {
        self.adapters
            .for_market(market)
            .ok_or_else(|| FetchError::InputInvalid(format!("no adapter for market {market}")))
    }

    // ---- Symbol list -----------------------------------------------------

    fn symbol_count_threshold(market: Market) -> i64 {
        match market {
            Market::AShare => 1_000,
            Market::UsStock => 100,
            Market::Crypto => 50,
            Market::HkStock | Market::Futures => 1,
        }
    }

    /// Canonical symbols for a market, refreshing from upstream when the
    /// stored roster is small or stale.
    pub async fn get_symbol_list(&self, market: Market) -> FetchResult<Vec<SymbolInfo>> {
        let count = self.store.symbol_count(market).await?;
        let stale = match self.store.oldest_symbol_refresh(market).await? {
            Some(oldest) => self.now() - oldest > ChronoDuration::hours(SYMBOL_LIST_MAX_AGE_HOURS),
            None => true,
        };

        if count < Self::symbol_count_threshold(market) || stale {
            if let Err(e) = self.refresh_symbol_list(market).await {
                // A refresh failure is not fatal while the store has a roster.
                if count == 0 {
                    return Err(e);
                }
                warn!(market = %market, error = %e, "symbol list refresh failed, serving stored roster");
            }
        }

        self.store.list_symbols(market).await
    }

    pub async fn force_refresh_symbol_list(&self, market: Market) -> FetchResult<RefreshOutcome> {
        let refreshed = self.refresh_symbol_list(market).await?;
        Ok(RefreshOutcome {
            refreshed,
            timestamp: self.now(),
        })
    }

    async fn refresh_symbol_list(&self, market: Market) -> FetchResult<usize> {
        let adapter = self.adapter_for(market)?;
        let roster = adapter.fetch_symbol_list().await?;
        if roster.is_empty() {
            return Ok(0);
        }
        let written = self.store.upsert_symbols(market, roster).await?;

        // Warm the list cache so the next read skips the store.
        let symbols = self.store.list_symbols(market).await?;
        let key = keys::build(keys::prefix::STOCK_INFO, "list", None, Some(market.as_str()));
        self.cache.set_json(Category::SymbolInfo, &key, &symbols).await;

        info!(market = %market, count = written, "symbol list refreshed");
        Ok(written)
    }

    // ---- OHLCV -----------------------------------------------------------

    fn ohlcv_cache_key(symbol: &Symbol, interval: Interval, trade_date: Option<NaiveDate>) -> String {
        let mut params = BTreeMap::new();
        params.insert("interval", interval.as_str().to_string());
        if let Some(date) = trade_date {
            params.insert("date", date.format("%Y-%m-%d").to_string());
        }
        keys::build_params(keys::prefix::STOCK_DAILY, &symbol.code, &params)
    }

    /// The canonical read pipeline (spec order): resolve, intraday bypass,
    /// cache, store freshness, upstream refresh through quality and store.
    pub async fn get_ohlcv(
        &self,
        raw_symbol: &str,
        interval: Interval,
        trade_date: Option<NaiveDate>,
    ) -> FetchResult<Vec<OhlcvRow>> {
        let Some(symbol) = symbols::resolve(raw_symbol) else {
            debug!(raw = raw_symbol, "unresolvable symbol, returning empty view");
            return Ok(Vec::new());
        };
        let adapter = self.adapter_for(symbol.market)?;
        if !adapter.supported_intervals().contains(&interval) {
            return Err(FetchError::InputInvalid(format!(
                "interval {interval} not supported for {}",
                symbol.code
            )));
        }

        // Intraday views never touch store or cache.
        if interval.bypasses_cache() {
            let rows = self
                .fetch_with_retry(&adapter, &symbol, interval, DateRange::default())
                .await?;
            return Ok(rows);
        }

        let cache_key = Self::ohlcv_cache_key(&symbol, interval, trade_date);
        if let Some(rows) = self
            .cache
            .get_json::<Vec<OhlcvRow>>(Category::DailyOhlcv, &cache_key)
            .await
        {
            return Ok(rows);
        }

        let result = self
            .flights
            .run(&cache_key, || {
                self.load_ohlcv(&adapter, symbol.clone(), interval, trade_date, cache_key.clone())
            })
            .await;

        match result {
            Ok(rows) => Ok((*rows).clone()),
            Err(shared) => Err((*shared).clone()),
        }
    }

    /// Leader body for one coalesced `(symbol, interval, date)` load.
    async fn load_ohlcv(
        &self,
        adapter: &Arc<dyn MarketAdapter>,
        symbol: Symbol,
        interval: Interval,
        trade_date: Option<NaiveDate>,
        cache_key: String,
    ) -> FetchResult<Arc<Vec<OhlcvRow>>> {
        let now = self.now();
        let to = trade_date.map(|d| d.format("%Y-%m-%d").to_string());

        let mut slice = self
            .store
            .read_ohlcv(&symbol.code, interval, None, to.clone())
            .await?;

        let latest = slice.last().map(|r| r.trade_date.clone());
        let fresh = match &latest {
            Some(latest_date) => {
                freshness::is_fresh(symbol.market, latest_date, now)
                    || trade_date
                        .map(|td| latest_date.as_str() >= td.format("%Y-%m-%d").to_string().as_str())
                        .unwrap_or(false)
            }
            None => false,
        };

        if fresh {
            recompute_mas(&mut slice);
            self.cache
                .set_json(Category::DailyOhlcv, &cache_key, &slice)
                .await;
            return Ok(Arc::new(slice));
        }

        if !self.breaker.allow(&symbol.code) {
            if slice.is_empty() {
                return Err(FetchError::CircuitOpen {
                    symbol: symbol.code,
                });
            }
            warn!(symbol = %symbol.code, "circuit open, serving stale store view");
            recompute_mas(&mut slice);
            return Ok(Arc::new(slice));
        }

        // Refresh from the last stored bar (inclusive, so the lag-derived
        // columns of the first new bar line up) or from scratch.
        let range = DateRange {
            start: latest
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            end: trade_date,
        };

        match self.fetch_with_retry(adapter, &symbol, interval, range).await {
            Ok(rows) if rows.is_empty() => {
                self.breaker.record_success(&symbol.code);
                debug!(symbol = %symbol.code, "upstream empty, serving last-known view");
                recompute_mas(&mut slice);
                Ok(Arc::new(slice))
            }
            Ok(rows) => {
                self.breaker.record_success(&symbol.code);
                let processed = quality::process_batch(rows, symbol.market);
                self.store.upsert_ohlcv(processed.rows).await?;

                let mut full = self
                    .store
                    .read_ohlcv(&symbol.code, interval, None, to)
                    .await?;
                recompute_mas(&mut full);
                self.cache
                    .set_json(Category::DailyOhlcv, &cache_key, &full)
                    .await;
                Ok(Arc::new(full))
            }
            Err(FetchError::Upstream(AdapterError::Malformed(msg))) => {
                self.breaker.record_failure(&symbol.code);
                warn!(symbol = %symbol.code, error = %msg, "malformed upstream batch dropped, serving last-known view");
                recompute_mas(&mut slice);
                Ok(Arc::new(slice))
            }
            Err(err) => {
                self.breaker.record_failure(&symbol.code);
                if slice.is_empty() {
                    Err(err)
                } else {
                    warn!(symbol = %symbol.code, error = %err, "upstream failed, serving stale store view");
                    recompute_mas(&mut slice);
                    Ok(Arc::new(slice))
                }
            }
        }
    }

    /// Adapter call with capped backoff for transient classes. Throttle
    /// hints are honored when the upstream provides them.
    async fn fetch_with_retry(
        &self,
        adapter: &Arc<dyn MarketAdapter>,
        symbol: &Symbol,
        interval: Interval,
        range: DateRange,
    ) -> FetchResult<Vec<OhlcvRow>> {
        let mut attempt: u32 = 0;
        loop {
            match adapter.fetch_ohlcv(symbol, interval, range).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = match &err {
                        AdapterError::Throttled {
                            retry_after: Some(after),
                        } => *after,
                        _ => retry_backoff(attempt),
                    };
                    debug!(
                        symbol = %symbol.code,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(FetchError::Upstream(err)),
            }
        }
    }

    // ---- Fundamentals / actions / earnings -------------------------------

    /// Cache-aside fundamentals; stale-store fallback on upstream trouble.
    pub async fn get_fundamentals(
        &self,
        raw_symbol: &str,
    ) -> FetchResult<Option<FundamentalSnapshot>> {
        let Some(symbol) = symbols::resolve(raw_symbol) else {
            return Ok(None);
        };
        let key = keys::build(keys::prefix::FUNDAMENTAL_DATA, &symbol.code, None, None);
        if let Some(snap) = self
            .cache
            .get_json::<FundamentalSnapshot>(Category::FundamentalData, &key)
            .await
        {
            return Ok(Some(snap));
        }

        let stored = self.store.get_fundamentals(&symbol.code).await?;
        if let Some(ref snap) = stored {
            if self.now() - snap.last_updated < ChronoDuration::hours(FUNDAMENTALS_MAX_AGE_HOURS) {
                self.cache
                    .set_json(Category::FundamentalData, &key, snap)
                    .await;
                return Ok(stored);
            }
        }

        let adapter = self.adapter_for(symbol.market)?;
        match adapter.fetch_fundamentals(&symbol).await {
            Ok(Some(snap)) => {
                self.store.upsert_fundamentals(snap.clone()).await?;
                self.cache
                    .set_json(Category::FundamentalData, &key, &snap)
                    .await;
                Ok(Some(snap))
            }
            Ok(None) => Ok(stored),
            Err(err) => {
                warn!(symbol = %symbol.code, error = %err, "fundamentals fetch failed, serving stored snapshot");
                Ok(stored)
            }
        }
    }

    pub async fn get_corporate_actions(
        &self,
        raw_symbol: &str,
    ) -> FetchResult<Vec<CorporateAction>> {
        let Some(symbol) = symbols::resolve(raw_symbol) else {
            return Ok(Vec::new());
        };
        let mut params = BTreeMap::new();
        params.insert("kind", "actions".to_string());
        let key = keys::build_params(keys::prefix::FUNDAMENTAL_DATA, &symbol.code, &params);
        if let Some(actions) = self
            .cache
            .get_json::<Vec<CorporateAction>>(Category::FundamentalData, &key)
            .await
        {
            return Ok(actions);
        }

        let stored = self.store.get_corporate_actions(&symbol.code).await?;
        if !stored.is_empty() {
            self.cache
                .set_json(Category::FundamentalData, &key, &stored)
                .await;
            return Ok(stored);
        }

        let adapter = self.adapter_for(symbol.market)?;
        match adapter.fetch_corporate_actions(&symbol).await {
            Ok(actions) => {
                if !actions.is_empty() {
                    self.store.upsert_corporate_actions(actions.clone()).await?;
                    self.cache
                        .set_json(Category::FundamentalData, &key, &actions)
                        .await;
                }
                Ok(actions)
            }
            Err(err) => {
                warn!(symbol = %symbol.code, error = %err, "corporate actions fetch failed");
                Ok(stored)
            }
        }
    }

    pub async fn get_annual_earnings(&self, raw_symbol: &str) -> FetchResult<Vec<AnnualEarnings>> {
        let Some(symbol) = symbols::resolve(raw_symbol) else {
            return Ok(Vec::new());
        };
        let mut params = BTreeMap::new();
        params.insert("kind", "earnings".to_string());
        let key = keys::build_params(keys::prefix::FUNDAMENTAL_DATA, &symbol.code, &params);
        if let Some(earnings) = self
            .cache
            .get_json::<Vec<AnnualEarnings>>(Category::FundamentalData, &key)
            .await
        {
            return Ok(earnings);
        }

        let stored = self.store.get_annual_earnings(&symbol.code).await?;
        if !stored.is_empty() {
            self.cache
                .set_json(Category::FundamentalData, &key, &stored)
                .await;
            return Ok(stored);
        }

        let adapter = self.adapter_for(symbol.market)?;
        match adapter.fetch_annual_earnings(&symbol).await {
            Ok(earnings) => {
                if !earnings.is_empty() {
                    self.store.upsert_annual_earnings(earnings.clone()).await?;
                    self.cache
                        .set_json(Category::FundamentalData, &key, &earnings)
                        .await;
                }
                Ok(earnings)
            }
            Err(err) => {
                warn!(symbol = %symbol.code, error = %err, "annual earnings fetch failed");
                Ok(stored)
            }
        }
    }

    /// Ratio screener over the latest daily metrics, cached per filter set.
    pub async fn screen_metrics(
        &self,
        market: Market,
        query: ScreenerQuery,
    ) -> FetchResult<Vec<crate::models::DailyMetrics>> {
        let mut query = query;
        if query.limit == 0 {
            query.limit = 100;
        }

        let mut params = BTreeMap::new();
        let mut bound = |name: &'static str, value: Option<f64>| {
            if let Some(v) = value {
                params.insert(name, format!("{v}"));
            }
        };
        bound("min_pe", query.min_pe);
        bound("max_pe", query.max_pe);
        bound("min_pb", query.min_pb);
        bound("max_pb", query.max_pb);
        bound("min_mcap", query.min_market_cap);
        bound("max_mcap", query.max_market_cap);
        bound("min_div", query.min_dividend_yield);
        params.insert("limit", query.limit.to_string());
        let key = keys::build_params(keys::prefix::FILTER_RESULT, market.as_str(), &params);

        if let Some(hits) = self
            .cache
            .get_json::<Vec<crate::models::DailyMetrics>>(Category::ScreenerResult, &key)
            .await
        {
            return Ok(hits);
        }

        let hits = self.store.screen_daily_metrics(market, query).await?;
        self.cache
            .set_json(Category::ScreenerResult, &key, &hits)
            .await;
        Ok(hits)
    }

    /// Pattern purge of every cache family for one symbol.
    pub async fn invalidate_symbol(&self, raw_symbol: &str) -> FetchResult<usize> {
        let Some(symbol) = symbols::resolve(raw_symbol) else {
            return Err(FetchError::InputInvalid(format!(
                "unresolvable symbol: {raw_symbol}"
            )));
        };
        let mut purged = 0;
        for prefix in [
            keys::prefix::STOCK_INFO,
            keys::prefix::STOCK_DAILY,
            keys::prefix::STOCK_METRICS,
            keys::prefix::FUNDAMENTAL_DATA,
        ] {
            purged += self
                .cache
                .invalidate_pattern(&format!("{prefix}:{}:*", symbol.code))
                .await;
        }
        info!(symbol = %symbol.code, purged, "symbol caches invalidated");
        Ok(purged)
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..250);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AdapterError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bar(symbol: &str, date: &str, close: f64) -> OhlcvRow {
        OhlcvRow {
            symbol: symbol.into(),
            interval: Interval::Daily,
            trade_date: date.into(),
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            pre_close: None,
            change: None,
            pct_chg: None,
            volume: 1_000.0,
            amount: None,
            ma5: None,
            ma10: None,
            ma20: None,
            ma60: None,
        }
    }

    /// Scripted adapter: pops one response per call, then repeats the last.
    struct MockAdapter {
        market: Market,
        responses: PlMutex<VecDeque<Result<Vec<OhlcvRow>, AdapterError>>>,
        calls: AtomicUsize,
    }

    impl MockAdapter {
        fn new(market: Market) -> Self {
            Self {
                market,
                responses: PlMutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn push(&self, response: Result<Vec<OhlcvRow>, AdapterError>) {
            self.responses.lock().push_back(response);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketAdapter for MockAdapter {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn market(&self) -> Market {
            self.market
        }

        fn supported_intervals(&self) -> &'static [Interval] {
            &[
                Interval::Minute,
                Interval::FiveDay,
                Interval::Daily,
                Interval::Weekly,
                Interval::Monthly,
            ]
        }

        async fn fetch_ohlcv(
            &self,
            _symbol: &Symbol,
            _interval: Interval,
            _range: DateRange,
        ) -> Result<Vec<OhlcvRow>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .lock()
                .pop_front()
                .unwrap_or(Ok(Vec::new()));
            // Hold the response briefly so concurrent readers pile onto the
            // in-flight call instead of racing past it.
            tokio::time::sleep(Duration::from_millis(20)).await;
            response
        }

        async fn fetch_fundamentals(
            &self,
            _symbol: &Symbol,
        ) -> Result<Option<FundamentalSnapshot>, AdapterError> {
            Ok(None)
        }
    }

    fn fixed_clock(y: i32, m: u32, d: u32) -> Clock {
        let now = Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap();
        Arc::new(move || now)
    }

    fn fetcher_with(adapter: Arc<MockAdapter>, clock: Clock) -> DataFetcher {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(CacheService::in_process_only(256));
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        DataFetcher::new(store, cache, Arc::new(registry)).with_clock(clock)
    }

    #[tokio::test]
    async fn unresolvable_symbol_returns_empty_view() {
        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        let fetcher = fetcher_with(adapter.clone(), fixed_clock(2024, 1, 20));
        let rows = fetcher
            .get_ohlcv("!!!", Interval::Daily, None)
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn fresh_store_slice_skips_the_adapter() {
        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        // Saturday 2024-01-20: Friday 01-19 close is fresh.
        let fetcher = fetcher_with(adapter.clone(), fixed_clock(2024, 1, 20));
        fetcher
            .store()
            .upsert_ohlcv(vec![
                bar("AAPL", "2024-01-18", 187.0),
                bar("AAPL", "2024-01-19", 188.0),
            ])
            .await
            .unwrap();

        let rows = fetcher
            .get_ohlcv("AAPL", Interval::Daily, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(adapter.calls(), 0, "fresh slice must not hit upstream");
    }

    #[tokio::test]
    async fn stale_store_refreshes_through_quality_and_store() {
        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        adapter.push(Ok(vec![
            bar("AAPL", "2024-01-19", 188.0),
            bar("AAPL", "2024-01-22", 190.0),
            // Exact duplicate the quality stage must suppress.
            bar("AAPL", "2024-01-22", 190.0),
        ]));
        // Tuesday 2024-01-23: store's 01-15 is stale.
        let fetcher = fetcher_with(adapter.clone(), fixed_clock(2024, 1, 23));
        fetcher
            .store()
            .upsert_ohlcv(vec![bar("AAPL", "2024-01-15", 185.0)])
            .await
            .unwrap();

        let rows = fetcher
            .get_ohlcv("AAPL", Interval::Daily, None)
            .await
            .unwrap();
        assert_eq!(adapter.calls(), 1);
        let dates: Vec<&str> = rows.iter().map(|r| r.trade_date.as_str()).collect();
        assert_eq!(dates, vec!["2024-01-15", "2024-01-19", "2024-01-22"]);

        // Second read is served from cache, still one upstream call.
        let again = fetcher
            .get_ohlcv("AAPL", Interval::Daily, None)
            .await
            .unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_then_succeed() {
        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        adapter.push(Err(AdapterError::Transport("reset".into())));
        adapter.push(Err(AdapterError::Transport("reset".into())));
        adapter.push(Ok(vec![bar("AAPL", "2024-01-22", 190.0)]));
        let fetcher = fetcher_with(adapter.clone(), fixed_clock(2024, 1, 23));

        let rows = fetcher
            .get_ohlcv("AAPL", Interval::Daily, None)
            .await
            .unwrap();
        assert_eq!(adapter.calls(), 3, "two retries then success");
        assert_eq!(rows.len(), 1);
        assert!(!fetcher.breaker.is_open("AAPL"), "circuit stays closed");
    }

    #[tokio::test]
    async fn malformed_upstream_serves_last_known() {
        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        adapter.push(Err(AdapterError::Malformed("bad json".into())));
        let fetcher = fetcher_with(adapter.clone(), fixed_clock(2024, 1, 23));
        fetcher
            .store()
            .upsert_ohlcv(vec![bar("AAPL", "2024-01-15", 185.0)])
            .await
            .unwrap();

        let rows = fetcher
            .get_ohlcv("AAPL", Interval::Daily, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1, "stale view served on malformed payload");
        assert_eq!(adapter.calls(), 1, "malformed is not retried");
    }

    #[tokio::test]
    async fn empty_upstream_returns_empty_not_error() {
        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        adapter.push(Ok(Vec::new()));
        let fetcher = fetcher_with(adapter.clone(), fixed_clock(2024, 1, 23));

        let rows = fetcher
            .get_ohlcv("AAPL", Interval::Daily, None)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        for _ in 0..40 {
            adapter.push(Err(AdapterError::Malformed("bad".into())));
        }
        let fetcher = fetcher_with(adapter.clone(), fixed_clock(2024, 1, 23))
            .with_breaker(CircuitBreaker::new(3, Duration::from_secs(300)));

        for _ in 0..3 {
            let _ = fetcher.get_ohlcv("AAPL", Interval::Daily, None).await;
        }
        assert!(fetcher.breaker.is_open("AAPL"));

        let calls_before = adapter.calls();
        let result = fetcher.get_ohlcv("AAPL", Interval::Daily, None).await;
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
        assert_eq!(adapter.calls(), calls_before, "open circuit blocks upstream");
    }

    #[tokio::test]
    async fn intraday_bypasses_store_and_cache() {
        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        adapter.push(Ok(vec![bar("AAPL", "2024-01-23T14:30:00+00:00", 190.0)]));
        adapter.push(Ok(vec![bar("AAPL", "2024-01-23T14:31:00+00:00", 190.5)]));
        let fetcher = fetcher_with(adapter.clone(), fixed_clock(2024, 1, 23));

        fetcher
            .get_ohlcv("AAPL", Interval::Minute, None)
            .await
            .unwrap();
        fetcher
            .get_ohlcv("AAPL", Interval::Minute, None)
            .await
            .unwrap();
        assert_eq!(adapter.calls(), 2, "every intraday read goes upstream");
    }

    #[tokio::test]
    async fn concurrent_cold_reads_coalesce_to_one_call() {
        let adapter = Arc::new(MockAdapter::new(Market::AShare));
        adapter.push(Ok(vec![
            bar("000001.SZ", "2024-01-19", 10.2),
            bar("000001.SZ", "2024-01-20", 10.3),
        ]));
        let fetcher = Arc::new(fetcher_with(adapter.clone(), fixed_clock(2024, 1, 20)));
        fetcher
            .store()
            .upsert_ohlcv(vec![bar("000001.SZ", "2024-01-18", 10.1)])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move {
                fetcher.get_ohlcv("000001.SZ", Interval::Daily, None).await
            }));
        }

        let mut first: Option<Vec<OhlcvRow>> = None;
        for handle in handles {
            let rows = handle.await.unwrap().unwrap();
            match &first {
                None => first = Some(rows),
                Some(expected) => assert_eq!(&rows, expected, "all callers share one result"),
            }
        }
        assert_eq!(adapter.calls(), 1, "exactly one adapter invocation");
    }

    #[tokio::test]
    async fn screener_results_are_cached_per_filter_set() {
        use crate::models::{DailyMetrics, ValidationStatus};
        use chrono::NaiveDate;

        let adapter = Arc::new(MockAdapter::new(Market::UsStock));
        let fetcher = fetcher_with(adapter, fixed_clock(2024, 3, 1));
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        fetcher
            .store()
            .upsert_daily_metrics(vec![DailyMetrics {
                code: "AAPL".into(),
                date,
                market: Market::UsStock,
                close_price: Some(180.0),
                ma5: None,
                ma20: None,
                volume: Some(1.0),
                pe_ratio: Some(28.0),
                pb_ratio: Some(40.0),
                market_cap: Some(2.9e12),
                dividend_yield: Some(0.5),
                data_source: "test".into(),
                quality_score: 1.0,
                validation_status: ValidationStatus::Validated,
                is_duplicate: false,
                duplicate_source: None,
            }])
            .await
            .unwrap();

        let query = ScreenerQuery {
            max_pe: Some(30.0),
            ..ScreenerQuery::with_limit(10)
        };
        let first = fetcher
            .screen_metrics(Market::UsStock, query.clone())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // A store change inside the TTL is not visible: the filter set is
        // served from cache.
        fetcher
            .store()
            .mark_duplicates(Market::UsStock, date, "X", vec!["AAPL".into()])
            .await
            .unwrap();
        let second = fetcher
            .screen_metrics(Market::UsStock, query)
            .await
            .unwrap();
        assert_eq!(second, first);

        // A different filter set misses the cache and sees the new state.
        let other = fetcher
            .screen_metrics(Market::UsStock, ScreenerQuery::with_limit(10))
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn symbol_list_refresh_gated_by_count_and_age() {
        struct RosterAdapter {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl MarketAdapter for RosterAdapter {
            fn name(&self) -> &'static str {
                "roster-mock"
            }
            fn market(&self) -> Market {
                Market::UsStock
            }
            fn supported_intervals(&self) -> &'static [Interval] {
                &[Interval::Daily]
            }
            async fn fetch_ohlcv(
                &self,
                _s: &Symbol,
                _i: Interval,
                _r: DateRange,
            ) -> Result<Vec<OhlcvRow>, AdapterError> {
                Ok(Vec::new())
            }
            async fn fetch_fundamentals(
                &self,
                _s: &Symbol,
            ) -> Result<Option<FundamentalSnapshot>, AdapterError> {
                Ok(None)
            }
            async fn fetch_symbol_list(&self) -> Result<Vec<(String, String)>, AdapterError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok((0..150)
                    .map(|i| (format!("SY{i}"), format!("Symbol {i}")))
                    .collect())
            }
        }

        let adapter = Arc::new(RosterAdapter {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(CacheService::in_process_only(256));
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());
        let fetcher = DataFetcher::new(store, cache, Arc::new(registry));

        let symbols = fetcher.get_symbol_list(Market::UsStock).await.unwrap();
        assert_eq!(symbols.len(), 150);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        // Roster is now large and fresh: no second bootstrap.
        let symbols = fetcher.get_symbol_list(Market::UsStock).await.unwrap();
        assert_eq!(symbols.len(), 150);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }
}
