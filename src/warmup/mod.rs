//! Warm-up scheduler: hot-symbol preloading, daily metrics refresh and the
//! industry overview precompute.
//!
//! A cooperative worker that runs once at startup and then on a fixed
//! cadence. Every job records start/end to the store's job bookkeeping so a
//! restart does not double-trigger, and each category is cancellation-safe:
//! aborting the scheduler task never leaves half-written state beyond rows
//! already upserted.

pub mod daily_metrics;
pub mod industry;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fetcher::freshness;
use crate::fetcher::DataFetcher;
use crate::models::{Interval, Market};
use industry::IndustrySource;

/// Static fallback when screener activity is too thin to rank hot symbols.
const FALLBACK_HOT_A_SHARE: &[&str] = &[
    "600519.SH", "000001.SZ", "000858.SZ", "601318.SH", "600036.SH", "000333.SZ", "002594.SZ",
    "601012.SH", "600900.SH", "300750.SZ",
];
const FALLBACK_HOT_US: &[&str] = &[
    "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "META", "TSLA", "JPM", "V", "UNH",
];

/// Preload cadence shaping: pause after every chunk of symbols so upstream
/// rate limits are respected.
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    pub hot_limit: usize,
    pub interval: Duration,
    pub industry_min_reseed: Duration,
    pub preload_chunk: usize,
    pub preload_pause: Duration,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            hot_limit: 100,
            interval: Duration::from_secs(3_600),
            industry_min_reseed: Duration::from_secs(12 * 3_600),
            preload_chunk: 10,
            preload_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PreloadStats {
    pub symbols: usize,
    pub views_loaded: usize,
    pub failures: usize,
}

pub struct WarmupScheduler {
    fetcher: Arc<DataFetcher>,
    config: WarmupConfig,
    industry_source: Option<Arc<dyn IndustrySource>>,
}

impl std::fmt::Debug for WarmupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WarmupScheduler {
    pub fn new(fetcher: Arc<DataFetcher>, config: WarmupConfig) -> Self {
        Self {
            fetcher,
            config,
            industry_source: None,
        }
    }

    pub fn with_industry_source(mut self, source: Arc<dyn IndustrySource>) -> Self {
        self.industry_source = Some(source);
        self
    }

    /// Start the scheduler loop: one cycle immediately, then on the cadence.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// One full warm-up cycle. Each job is independent: a failure in one is
    /// logged and the next still runs.
    pub async fn run_cycle(&self) {
        info!("warm-up cycle starting");

        for market in [Market::AShare, Market::UsStock] {
            match self.preload_hot_symbols(market).await {
                Ok(stats) => debug!(
                    market = %market,
                    symbols = stats.symbols,
                    views = stats.views_loaded,
                    "hot-symbol preload done"
                ),
                Err(e) => warn!(market = %market, error = %e, "hot-symbol preload failed"),
            }
        }

        for market in [Market::AShare, Market::UsStock] {
            let today = freshness::local_today(market, Utc::now());
            let job = format!("daily_metrics:{}", market.as_str());
            if let Err(e) = self.fetcher.store().job_started(&job).await {
                warn!(error = %e, "job bookkeeping unavailable");
            }
            match daily_metrics::refresh_daily_metrics(&self.fetcher, market, today).await {
                Ok(stats) => {
                    let _ = self
                        .fetcher
                        .store()
                        .job_finished(&job, serde_json::to_string(&stats).ok())
                        .await;
                }
                Err(e) => warn!(market = %market, error = %e, "daily metrics refresh failed"),
            }
        }

        if let Some(source) = &self.industry_source {
            match industry::warm_industries(
                &self.fetcher,
                source,
                self.config.industry_min_reseed,
                Utc::now(),
            )
            .await
            {
                Ok(stats) if stats.skipped => debug!("industry warming skipped (reseed window)"),
                Ok(stats) => debug!(published = stats.published, "industry warming done"),
                Err(e) => warn!(error = %e, "industry warming failed"),
            }
        }

        info!("warm-up cycle finished");
    }

    /// Compute the hot set and pull its daily/weekly/monthly views through
    /// the coordinator, which populates the caches as a side effect.
    pub async fn preload_hot_symbols(&self, market: Market) -> crate::errors::FetchResult<PreloadStats> {
        let job = format!("warmup_hot:{}", market.as_str());
        self.fetcher.store().job_started(&job).await?;

        let mut hot = self
            .fetcher
            .store()
            .hot_codes(market, self.config.hot_limit)
            .await?;
        if hot.len() < 10 {
            let fallback: &[&str] = match market {
                Market::AShare => FALLBACK_HOT_A_SHARE,
                Market::UsStock => FALLBACK_HOT_US,
                _ => &[],
            };
            for code in fallback {
                if !hot.iter().any(|h| h == code) {
                    hot.push((*code).to_string());
                }
            }
            hot.truncate(self.config.hot_limit);
        }

        let mut stats = PreloadStats {
            symbols: hot.len(),
            ..Default::default()
        };

        for (idx, code) in hot.iter().enumerate() {
            for interval in [Interval::Daily, Interval::Weekly, Interval::Monthly] {
                match self.fetcher.get_ohlcv(code, interval, None).await {
                    Ok(_) => stats.views_loaded += 1,
                    Err(e) => {
                        stats.failures += 1;
                        debug!(code, interval = %interval, error = %e, "preload fetch failed");
                    }
                }
            }
            // Rate-limit shaping: pause between chunks.
            if (idx + 1) % self.config.preload_chunk == 0 {
                tokio::time::sleep(self.config.preload_pause).await;
            }
        }

        self.fetcher
            .store()
            .job_finished(&job, serde_json::to_string(&stats).ok())
            .await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterRegistry, DateRange, MarketAdapter};
    use crate::cache::CacheService;
    use crate::errors::AdapterError;
    use crate::fetcher::DataFetcher;
    use crate::models::{FundamentalSnapshot, OhlcvRow, SpotQuote};
    use crate::store::Store;
    use crate::symbols::Symbol;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct WarmMock {
        ohlcv_calls: AtomicUsize,
        spot_batches: AtomicUsize,
        fail_all: bool,
    }

    impl WarmMock {
        fn new(fail_all: bool) -> Self {
            Self {
                ohlcv_calls: AtomicUsize::new(0),
                spot_batches: AtomicUsize::new(0),
                fail_all,
            }
        }
    }

    #[async_trait]
    impl MarketAdapter for WarmMock {
        fn name(&self) -> &'static str {
            "warm-mock"
        }
        fn market(&self) -> Market {
            Market::UsStock
        }
        fn supported_intervals(&self) -> &'static [Interval] {
            &[
                Interval::Daily,
                Interval::Weekly,
                Interval::Monthly,
            ]
        }
        async fn fetch_ohlcv(
            &self,
            symbol: &Symbol,
            interval: Interval,
            _range: DateRange,
        ) -> Result<Vec<OhlcvRow>, AdapterError> {
            self.ohlcv_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all {
                return Err(AdapterError::Transport("down".into()));
            }
            Ok(vec![OhlcvRow {
                symbol: symbol.code.clone(),
                interval,
                trade_date: "2030-01-03".into(),
                open: 10.0,
                high: 11.0,
                low: 9.5,
                close: 10.5,
                pre_close: None,
                change: None,
                pct_chg: None,
                volume: 100.0,
                amount: None,
                ma5: None,
                ma10: None,
                ma20: None,
                ma60: None,
            }])
        }
        async fn fetch_fundamentals(
            &self,
            _symbol: &Symbol,
        ) -> Result<Option<FundamentalSnapshot>, AdapterError> {
            Ok(None)
        }
        async fn fetch_spot_batch(
            &self,
            symbols: &[String],
        ) -> Result<Option<Vec<SpotQuote>>, AdapterError> {
            self.spot_batches.fetch_add(1, Ordering::SeqCst);
            Ok(Some(
                symbols
                    .iter()
                    .enumerate()
                    .map(|(i, s)| SpotQuote {
                        symbol: s.clone(),
                        price: 10.0 + i as f64 * 0.5,
                        volume: Some(1_000.0 + i as f64),
                        pe_ratio: Some(20.0),
                        pb_ratio: Some(3.0),
                        market_cap: Some(1.0e9),
                        dividend_yield: Some(1.0),
                    })
                    .collect(),
            ))
        }
        async fn fetch_symbol_list(&self) -> Result<Vec<(String, String)>, AdapterError> {
            Ok((0..120)
                .map(|i| (mock_code(i), format!("Symbol {i}")))
                .collect())
        }
    }

    /// Two-letter roster codes that satisfy the US symbol grammar and sort
    /// in generation order.
    fn mock_code(i: usize) -> String {
        format!(
            "{}{}",
            (b'A' + (i / 26) as u8) as char,
            (b'A' + (i % 26) as u8) as char
        )
    }

    fn scheduler_with(adapter: Arc<WarmMock>) -> (Arc<WarmupScheduler>, Arc<DataFetcher>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(CacheService::in_process_only(4096));
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        let fetcher = Arc::new(DataFetcher::new(store, cache, Arc::new(registry)));
        let config = WarmupConfig {
            hot_limit: 12,
            preload_pause: Duration::from_millis(1),
            ..Default::default()
        };
        (
            Arc::new(WarmupScheduler::new(fetcher.clone(), config)),
            fetcher,
        )
    }

    #[tokio::test]
    async fn preload_uses_fallback_hot_set_and_fills_cache() {
        let adapter = Arc::new(WarmMock::new(false));
        let (scheduler, fetcher) = scheduler_with(adapter.clone());

        let stats = scheduler.preload_hot_symbols(Market::UsStock).await.unwrap();
        assert_eq!(stats.symbols, FALLBACK_HOT_US.len());
        assert_eq!(stats.views_loaded, stats.symbols * 3);
        assert_eq!(stats.failures, 0);

        // The preload populated the coordinator's caches: reading one of the
        // hot views again must not hit upstream.
        let calls_before = adapter.ohlcv_calls.load(Ordering::SeqCst);
        fetcher
            .get_ohlcv("AAPL", Interval::Daily, None)
            .await
            .unwrap();
        assert_eq!(adapter.ohlcv_calls.load(Ordering::SeqCst), calls_before);

        // Job bookkeeping recorded the run.
        assert!(fetcher
            .store()
            .last_job_finish("warmup_hot:US_stock")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn preload_counts_failures_but_does_not_abort() {
        let adapter = Arc::new(WarmMock::new(true));
        let (scheduler, _fetcher) = scheduler_with(adapter);

        let stats = scheduler.preload_hot_symbols(Market::UsStock).await.unwrap();
        assert_eq!(stats.views_loaded, 0);
        assert_eq!(stats.failures, stats.symbols * 3);
    }

    #[tokio::test]
    async fn daily_metrics_batch_path_writes_validated_rows() {
        let adapter = Arc::new(WarmMock::new(false));
        let (_, fetcher) = scheduler_with(adapter.clone());

        let date = NaiveDate::from_ymd_opt(2030, 1, 3).unwrap();
        let stats = daily_metrics::refresh_daily_metrics(&fetcher, Market::UsStock, date)
            .await
            .unwrap();
        assert_eq!(adapter.spot_batches.load(Ordering::SeqCst), 1);
        assert_eq!(stats.succeeded, 120);
        assert_eq!(stats.invalid, 0);
        assert_eq!(stats.duplicates_marked, 0);
        assert!(stats.aborted.is_none());

        let row = fetcher
            .store()
            .get_daily_metrics("AA", Market::UsStock, date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.close_price, Some(10.0));
        assert_eq!(row.pe_ratio, Some(20.0));
        assert_eq!(row.data_source, "warm-mock");
        assert_eq!(row.validation_status, crate::models::ValidationStatus::Validated);
        assert_eq!(row.quality_score, 1.0);
        assert!(!row.is_duplicate);
    }

    /// Configurable spot-batch mock for the quality-stage wiring tests.
    struct SpotMock {
        roster: Vec<(String, String)>,
        quotes: std::collections::HashMap<String, SpotQuote>,
    }

    #[async_trait]
    impl MarketAdapter for SpotMock {
        fn name(&self) -> &'static str {
            "spot-mock"
        }
        fn market(&self) -> Market {
            Market::UsStock
        }
        fn supported_intervals(&self) -> &'static [Interval] {
            &[Interval::Daily]
        }
        async fn fetch_ohlcv(
            &self,
            _symbol: &Symbol,
            _interval: Interval,
            _range: DateRange,
        ) -> Result<Vec<OhlcvRow>, AdapterError> {
            Ok(Vec::new())
        }
        async fn fetch_fundamentals(
            &self,
            _symbol: &Symbol,
        ) -> Result<Option<FundamentalSnapshot>, AdapterError> {
            Ok(None)
        }
        async fn fetch_spot_batch(
            &self,
            symbols: &[String],
        ) -> Result<Option<Vec<SpotQuote>>, AdapterError> {
            Ok(Some(
                symbols
                    .iter()
                    .filter_map(|s| self.quotes.get(s).cloned())
                    .collect(),
            ))
        }
        async fn fetch_symbol_list(&self) -> Result<Vec<(String, String)>, AdapterError> {
            Ok(self.roster.clone())
        }
    }

    fn quote(code: &str, price: f64, volume: f64) -> SpotQuote {
        SpotQuote {
            symbol: code.into(),
            price,
            volume: Some(volume),
            pe_ratio: Some(20.0),
            pb_ratio: Some(3.0),
            market_cap: Some(1.0e9),
            dividend_yield: Some(1.0),
        }
    }

    fn fetcher_with_spot(mock: SpotMock) -> Arc<DataFetcher> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(CacheService::in_process_only(256));
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(mock));
        Arc::new(DataFetcher::new(store, cache, Arc::new(registry)))
    }

    #[tokio::test]
    async fn spot_batch_twins_are_marked_in_the_store() {
        let mock = SpotMock {
            roster: vec![
                ("DUPA".into(), "Dup A".into()),
                ("DUPB".into(), "Dup B".into()),
                ("SOLO".into(), "Solo".into()),
            ],
            quotes: [
                ("DUPA".to_string(), quote("DUPA", 12.5, 500.0)),
                ("DUPB".to_string(), quote("DUPB", 12.5, 500.0)),
                ("SOLO".to_string(), quote("SOLO", 99.0, 42.0)),
            ]
            .into_iter()
            .collect(),
        };
        let fetcher = fetcher_with_spot(mock);

        let date = NaiveDate::from_ymd_opt(2030, 1, 3).unwrap();
        let stats = daily_metrics::refresh_daily_metrics(&fetcher, Market::UsStock, date)
            .await
            .unwrap();
        assert_eq!(stats.succeeded, 3, "twins are written, not dropped");
        assert_eq!(stats.duplicates_marked, 1);

        let a = fetcher
            .store()
            .get_daily_metrics("DUPA", Market::UsStock, date)
            .await
            .unwrap()
            .unwrap();
        let b = fetcher
            .store()
            .get_daily_metrics("DUPB", Market::UsStock, date)
            .await
            .unwrap()
            .unwrap();
        let (kept, suppressed) = if a.is_duplicate { (b, a) } else { (a, b) };
        assert!(!kept.is_duplicate);
        assert!(suppressed.is_duplicate);
        assert_eq!(suppressed.duplicate_source.as_deref(), Some(kept.code.as_str()));

        let solo = fetcher
            .store()
            .get_daily_metrics("SOLO", Market::UsStock, date)
            .await
            .unwrap()
            .unwrap();
        assert!(!solo.is_duplicate);
    }

    #[tokio::test]
    async fn invalid_spot_rows_are_kept_with_failed_status() {
        let mock = SpotMock {
            roster: vec![
                ("GOOD".into(), "Good Co".into()),
                ("BADX".into(), "Bad Co".into()),
            ],
            quotes: [
                ("GOOD".to_string(), quote("GOOD", 10.0, 100.0)),
                ("BADX".to_string(), quote("BADX", -5.0, 100.0)),
            ]
            .into_iter()
            .collect(),
        };
        let fetcher = fetcher_with_spot(mock);

        let date = NaiveDate::from_ymd_opt(2030, 1, 3).unwrap();
        let stats = daily_metrics::refresh_daily_metrics(&fetcher, Market::UsStock, date)
            .await
            .unwrap();
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.succeeded, 2, "invalid row is still written");

        let bad = fetcher
            .store()
            .get_daily_metrics("BADX", Market::UsStock, date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bad.validation_status, crate::models::ValidationStatus::Failed);
        assert!(bad.quality_score < 1.0);

        let good = fetcher
            .store()
            .get_daily_metrics("GOOD", Market::UsStock, date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(good.validation_status, crate::models::ValidationStatus::Validated);
    }
}
