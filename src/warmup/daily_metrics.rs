//! Daily derived-metrics refresh.
//!
//! One batched spot call per market where the adapter supports it, falling
//! back to per-symbol fetches. Every constructed row runs through the data
//! quality stage before it lands: validation grades the row (invalid rows
//! are kept and stored with `validation_status = failed`), and the dedup
//! pass marks cross-code twins in the store instead of deleting them. Two
//! circuit breakers guard the run: a consecutive-failure ceiling and a
//! total-failure ceiling; tripping either aborts cleanly so rows already
//! upserted stay in place.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::FetchResult;
use crate::fetcher::DataFetcher;
use crate::models::{DailyMetrics, Interval, Market, SpotQuote, ValidationStatus};
use crate::quality::{self, DedupStrategy, MetricsDuplicateGroup};

/// Consecutive upstream failures before the run aborts. One ceiling for
/// every upstream path.
pub const MAX_CONSECUTIVE_FAILURES: usize = 10;

/// Total-failure ceiling: `min(50, symbols / 10)`, at least 1.
pub fn max_total_failures(symbol_count: usize) -> usize {
    (symbol_count / 10).min(50).max(1)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Rows kept despite validation errors (stored with failed status).
    pub invalid: usize,
    /// Store rows flagged as cross-code duplicates this run.
    pub duplicates_marked: usize,
    /// Set when a breaker tripped and the run stopped early.
    pub aborted: Option<String>,
}

/// Moving averages from the stored close history, if enough bars exist.
async fn stored_mas(fetcher: &DataFetcher, code: &str) -> (Option<f64>, Option<f64>) {
    let rows = match fetcher
        .store()
        .read_ohlcv(code, Interval::Daily, None, None)
        .await
    {
        Ok(rows) => rows,
        Err(_) => return (None, None),
    };
    let closes: Vec<f64> = rows.iter().map(|r| r.close).collect();
    let mean_of_last = |n: usize| {
        (closes.len() >= n).then(|| closes[closes.len() - n..].iter().sum::<f64>() / n as f64)
    };
    (mean_of_last(5), mean_of_last(20))
}

async fn metrics_from_quote(
    fetcher: &DataFetcher,
    quote: &SpotQuote,
    market: Market,
    date: NaiveDate,
    source: &str,
) -> DailyMetrics {
    let (ma5, ma20) = stored_mas(fetcher, &quote.symbol).await;
    DailyMetrics {
        code: quote.symbol.clone(),
        date,
        market,
        close_price: Some(quote.price),
        ma5,
        ma20,
        volume: quote.volume,
        pe_ratio: quote.pe_ratio,
        pb_ratio: quote.pb_ratio,
        market_cap: quote.market_cap,
        dividend_yield: quote.dividend_yield,
        data_source: source.to_string(),
        quality_score: 0.0,
        validation_status: ValidationStatus::Pending,
        is_duplicate: false,
        duplicate_source: None,
    }
}

/// Grade one row and stamp the outcome onto it. Invalid rows stay in the
/// batch; the failed status on the stored row is what keeps them auditable.
fn grade(row: &mut DailyMetrics) -> bool {
    let report = quality::validate_metrics_row(row);
    row.quality_score = report.quality_score;
    row.validation_status = if report.is_valid() {
        ValidationStatus::Validated
    } else {
        ValidationStatus::Failed
    };
    if !report.is_valid() {
        warn!(
            code = %row.code,
            errors = ?report.errors,
            "invalid metrics row kept with failed status"
        );
    }
    report.is_valid()
}

/// Persist the dedup decisions: suppressed cross-code rows are flagged with
/// a pointer at the kept record. Same-key collapses have nothing to mark.
async fn mark_groups(fetcher: &DataFetcher, groups: &[MetricsDuplicateGroup]) -> usize {
    let mut marked = 0usize;
    for group in groups {
        let to_mark: Vec<String> = group
            .suppressed_codes
            .iter()
            .filter(|code| **code != group.kept_code)
            .cloned()
            .collect();
        if to_mark.is_empty() {
            continue;
        }
        match fetcher
            .store()
            .mark_duplicates(group.market, group.date, &group.kept_code, to_mark)
            .await
        {
            Ok(n) => marked += n,
            Err(e) => warn!(
                kept = %group.kept_code,
                error = %e,
                "failed to mark duplicate metrics rows"
            ),
        }
    }
    marked
}

/// Refresh today's metrics row for every symbol in a market.
pub async fn refresh_daily_metrics(
    fetcher: &DataFetcher,
    market: Market,
    date: NaiveDate,
) -> FetchResult<RefreshStats> {
    let symbols = fetcher.get_symbol_list(market).await?;
    let codes: Vec<String> = symbols.into_iter().map(|s| s.ts_code).collect();
    if codes.is_empty() {
        return Ok(RefreshStats::default());
    }

    let adapter = fetcher.adapter_for(market)?;
    let mut stats = RefreshStats::default();

    // Preferred path: one batched spot call for the whole roster.
    match adapter.fetch_spot_batch(&codes).await {
        Ok(Some(quotes)) if !quotes.is_empty() => {
            let mut rows = Vec::with_capacity(quotes.len());
            for quote in &quotes {
                let mut row =
                    metrics_from_quote(fetcher, quote, market, date, adapter.name()).await;
                if !grade(&mut row) {
                    stats.invalid += 1;
                }
                rows.push(row);
            }

            let groups = quality::deduplicate_metrics(&mut rows, DedupStrategy::KeepHighestQuality);
            stats.processed = rows.len();
            stats.succeeded = fetcher.store().upsert_daily_metrics(rows).await?;
            stats.duplicates_marked = mark_groups(fetcher, &groups).await;
            info!(
                market = %market,
                updated = stats.succeeded,
                invalid = stats.invalid,
                duplicates = stats.duplicates_marked,
                "daily metrics refreshed from spot batch"
            );
            return Ok(stats);
        }
        Ok(_) => {
            // No batch endpoint (or an empty batch): per-symbol fallback.
        }
        Err(e) => {
            warn!(market = %market, error = %e, "spot batch failed, falling back to per-symbol fetches");
        }
    }

    let max_total = max_total_failures(codes.len());
    let mut consecutive = 0usize;
    let mut upserted: Vec<DailyMetrics> = Vec::new();

    for code in &codes {
        stats.processed += 1;

        let last_close = fetcher
            .get_ohlcv(code, Interval::Daily, Some(date))
            .await
            .ok()
            .and_then(|rows| rows.last().cloned());
        let fundamentals = fetcher.get_fundamentals(code).await.unwrap_or(None);

        let Some(bar) = last_close else {
            stats.failed += 1;
            consecutive += 1;
            if consecutive >= MAX_CONSECUTIVE_FAILURES {
                stats.aborted = Some(format!("{consecutive} consecutive failures"));
                break;
            }
            if stats.failed >= max_total {
                stats.aborted = Some(format!("{} total failures (ceiling {max_total})", stats.failed));
                break;
            }
            continue;
        };
        consecutive = 0;

        let (ma5, ma20) = stored_mas(fetcher, code).await;
        let mut row = DailyMetrics {
            code: code.clone(),
            date,
            market,
            close_price: Some(bar.close),
            ma5,
            ma20,
            volume: Some(bar.volume),
            pe_ratio: fundamentals.as_ref().and_then(|f| f.pe_ratio),
            pb_ratio: fundamentals.as_ref().and_then(|f| f.pb_ratio),
            market_cap: fundamentals.as_ref().and_then(|f| f.market_cap),
            dividend_yield: fundamentals.as_ref().and_then(|f| f.dividend_yield),
            data_source: adapter.name().to_string(),
            quality_score: 0.0,
            validation_status: ValidationStatus::Pending,
            is_duplicate: false,
            duplicate_source: None,
        };
        if !grade(&mut row) {
            stats.invalid += 1;
        }

        // Incremental upsert so an aborted run keeps its successes.
        match fetcher.store().upsert_daily_metrics(vec![row.clone()]).await {
            Ok(n) => {
                stats.succeeded += n;
                upserted.push(row);
            }
            Err(e) => {
                warn!(code, error = %e, "daily metrics upsert failed");
                stats.failed += 1;
            }
        }
    }

    // Dedup over what actually landed; an aborted run still marks the twins
    // among its preserved successes.
    let groups = quality::deduplicate_metrics(&mut upserted, DedupStrategy::KeepHighestQuality);
    stats.duplicates_marked = mark_groups(fetcher, &groups).await;

    if let Some(reason) = &stats.aborted {
        warn!(market = %market, reason, "daily metrics run aborted early");
    } else {
        info!(
            market = %market,
            updated = stats.succeeded,
            failed = stats.failed,
            invalid = stats.invalid,
            duplicates = stats.duplicates_marked,
            "daily metrics refreshed per-symbol"
        );
    }
    Ok(stats)
}
