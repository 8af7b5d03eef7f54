//! Duplicate detection and resolution.
//!
//! Rows are grouped by the target table's primary key; inside a group a
//! weighted field similarity classifies pairs as exact / partial / similar.
//! Suppressed rows are reported, never silently dropped; the store marks
//! them `is_duplicate` with a pointer at the kept record.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::models::{DailyMetrics, Market, OhlcvRow};
use crate::quality::validation::ValidationReport;

const WEIGHT_CODE: f64 = 0.30;
const WEIGHT_DATE: f64 = 0.30;
const WEIGHT_CLOSE: f64 = 0.20;
const WEIGHT_VOLUME: f64 = 0.10;
const WEIGHT_OHL: f64 = 0.10;

pub const THRESHOLD_EXACT: f64 = 1.0;
pub const THRESHOLD_PARTIAL: f64 = 0.8;
pub const THRESHOLD_SIMILAR: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateType {
    Exact,
    Partial,
    Similar,
}

impl DuplicateType {
    fn classify(similarity: f64) -> Option<DuplicateType> {
        if similarity >= THRESHOLD_EXACT - f64::EPSILON {
            Some(DuplicateType::Exact)
        } else if similarity >= THRESHOLD_PARTIAL {
            Some(DuplicateType::Partial)
        } else if similarity >= THRESHOLD_SIMILAR {
            Some(DuplicateType::Similar)
        } else {
            None
        }
    }
}

/// How to pick the surviving record of a duplicate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    KeepFirst,
    KeepLast,
    KeepHighestQuality,
    /// Reserved. Falls back to `KeepHighestQuality` with a warning.
    Merge,
}

/// One resolved duplicate group, indexes into the input batch.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub kept: usize,
    pub suppressed: Vec<usize>,
    pub duplicate_type: DuplicateType,
    pub similarity: f64,
}

/// Summary of one deduplication pass.
#[derive(Debug, Clone, Serialize)]
pub struct DeduplicationReport {
    pub total_records: usize,
    pub unique_records: usize,
    pub duplicates_suppressed: usize,
    pub strategy: DedupStrategy,
    pub groups: Vec<DuplicateGroup>,
}

/// Relative closeness of two non-negative measures, in `[0, 1]`.
fn numeric_similarity(a: f64, b: f64) -> f64 {
    if a == b {
        return 1.0;
    }
    let denom = a.abs().max(b.abs());
    if denom == 0.0 {
        return 1.0;
    }
    (1.0 - (a - b).abs() / denom).max(0.0)
}

/// Weighted similarity over the dedup field set.
pub fn row_similarity(a: &OhlcvRow, b: &OhlcvRow) -> f64 {
    let code = if a.symbol == b.symbol { WEIGHT_CODE } else { 0.0 };
    let date = if a.trade_date == b.trade_date {
        WEIGHT_DATE
    } else {
        0.0
    };
    let close = WEIGHT_CLOSE * numeric_similarity(a.close, b.close);
    let volume = WEIGHT_VOLUME * numeric_similarity(a.volume, b.volume);
    let ohl = WEIGHT_OHL
        * (numeric_similarity(a.open, b.open)
            + numeric_similarity(a.high, b.high)
            + numeric_similarity(a.low, b.low))
        / 3.0;

    code + date + close + volume + ohl
}

fn group_key(row: &OhlcvRow) -> String {
    format!("{}|{}|{}", row.symbol, row.interval.as_str(), row.trade_date)
}

fn pick_kept(
    indices: &[usize],
    strategy: DedupStrategy,
    quality: Option<&[ValidationReport]>,
) -> usize {
    match strategy {
        DedupStrategy::KeepFirst => indices[0],
        DedupStrategy::KeepLast => *indices.last().unwrap_or(&indices[0]),
        DedupStrategy::KeepHighestQuality => match quality {
            Some(reports) => *indices
                .iter()
                .max_by(|&&x, &&y| {
                    let qx = reports.get(x).map(|r| r.quality_score).unwrap_or(0.0);
                    let qy = reports.get(y).map(|r| r.quality_score).unwrap_or(0.0);
                    qx.partial_cmp(&qy).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(&indices[0]),
            None => indices[0],
        },
        DedupStrategy::Merge => {
            warn!("merge dedup strategy is reserved; using keep_highest_quality");
            pick_kept(indices, DedupStrategy::KeepHighestQuality, quality)
        }
    }
}

/// Deduplicate a batch keyed by `(symbol, interval, trade_date)`.
///
/// Returns the surviving rows in input order plus a report enumerating
/// every group. Idempotent: running the output through again yields no
/// groups.
pub fn deduplicate(
    rows: Vec<OhlcvRow>,
    strategy: DedupStrategy,
    quality: Option<&[ValidationReport]>,
) -> (Vec<OhlcvRow>, DeduplicationReport) {
    let total = rows.len();

    // BTreeMap for deterministic group ordering in the report.
    let mut by_key: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        by_key.entry(group_key(row)).or_default().push(idx);
    }

    let mut groups = Vec::new();
    let mut suppressed_idx: Vec<bool> = vec![false; total];

    for (key, indices) in &by_key {
        if indices.len() < 2 {
            continue;
        }
        let kept = pick_kept(indices, strategy, quality);

        // Pairwise similarity against the kept row; the group's class is the
        // weakest pair so partial groups are not overstated as exact.
        let mut min_similarity: f64 = 1.0;
        let mut suppressed = Vec::new();
        for &idx in indices {
            if idx == kept {
                continue;
            }
            min_similarity = min_similarity.min(row_similarity(&rows[kept], &rows[idx]));
            suppressed.push(idx);
            suppressed_idx[idx] = true;
        }

        let duplicate_type =
            DuplicateType::classify(min_similarity).unwrap_or(DuplicateType::Similar);
        groups.push(DuplicateGroup {
            key: key.clone(),
            kept,
            suppressed,
            duplicate_type,
            similarity: min_similarity,
        });
    }

    let surviving: Vec<OhlcvRow> = rows
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !suppressed_idx[*idx])
        .map(|(_, row)| row)
        .collect();

    let report = DeduplicationReport {
        total_records: total,
        unique_records: surviving.len(),
        duplicates_suppressed: total - surviving.len(),
        strategy,
        groups,
    };

    (surviving, report)
}

/// Weighted similarity for daily-metrics rows. Same weights as the OHLCV
/// field set; the trailing open/high/low share is spread over the ratio
/// columns these rows carry instead.
pub fn metrics_similarity(a: &DailyMetrics, b: &DailyMetrics) -> f64 {
    let code = if a.code == b.code { WEIGHT_CODE } else { 0.0 };
    let date = if a.date == b.date { WEIGHT_DATE } else { 0.0 };
    let close = WEIGHT_CLOSE * opt_similarity(a.close_price, b.close_price);
    let volume = WEIGHT_VOLUME * opt_similarity(a.volume, b.volume);
    let ratios = WEIGHT_OHL
        * (opt_similarity(a.pe_ratio, b.pe_ratio)
            + opt_similarity(a.pb_ratio, b.pb_ratio)
            + opt_similarity(a.market_cap, b.market_cap))
        / 3.0;

    code + date + close + volume + ratios
}

fn opt_similarity(a: Option<f64>, b: Option<f64>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => numeric_similarity(a, b),
        (None, None) => 1.0,
        _ => 0.0,
    }
}

/// One resolved duplicate group over daily-metrics rows, keyed by code so
/// the store can mark the suppressed rows.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsDuplicateGroup {
    pub date: NaiveDate,
    pub market: Market,
    pub kept_code: String,
    pub suppressed_codes: Vec<String>,
    pub duplicate_type: DuplicateType,
    pub similarity: f64,
}

fn pick_kept_metrics(indices: &[usize], rows: &[DailyMetrics], strategy: DedupStrategy) -> usize {
    match strategy {
        DedupStrategy::KeepFirst => indices[0],
        DedupStrategy::KeepLast => *indices.last().unwrap_or(&indices[0]),
        DedupStrategy::KeepHighestQuality => *indices
            .iter()
            .max_by(|&&x, &&y| {
                rows[x]
                    .quality_score
                    .partial_cmp(&rows[y].quality_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(&indices[0]),
        DedupStrategy::Merge => {
            warn!("merge dedup strategy is reserved; using keep_highest_quality");
            pick_kept_metrics(indices, rows, DedupStrategy::KeepHighestQuality)
        }
    }
}

fn metrics_group_key(row: &DailyMetrics) -> String {
    format!("{}|{}|{}", row.code, row.date, row.market.as_str())
}

/// Deduplicate a daily-metrics batch against the table's natural key.
///
/// Two passes. Rows sharing `(code, date, market)` cannot coexist under the
/// store's unique constraint, so the batch collapses to one per key (chosen
/// by strategy) and reports the rest. Rows under *different* codes with the
/// same date/market and byte-identical close and volume are cross-code
/// twins (the same listing surfacing under two codes); those stay in the
/// batch and are reported so the store can mark them `is_duplicate` with a
/// pointer at the kept code, rather than deleting anything.
pub fn deduplicate_metrics(
    rows: &mut Vec<DailyMetrics>,
    strategy: DedupStrategy,
) -> Vec<MetricsDuplicateGroup> {
    let mut groups = Vec::new();

    // Pass 1: same-key collapse so the upsert is not order-dependent.
    let mut by_key: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        by_key.entry(metrics_group_key(row)).or_default().push(idx);
    }

    let mut collapsed = vec![false; rows.len()];
    for indices in by_key.values() {
        if indices.len() < 2 {
            continue;
        }
        let kept = pick_kept_metrics(indices, rows, strategy);
        let mut min_similarity: f64 = 1.0;
        let mut dropped = 0usize;
        for &idx in indices {
            if idx == kept {
                continue;
            }
            min_similarity = min_similarity.min(metrics_similarity(&rows[kept], &rows[idx]));
            collapsed[idx] = true;
            dropped += 1;
        }
        groups.push(MetricsDuplicateGroup {
            date: rows[kept].date,
            market: rows[kept].market,
            kept_code: rows[kept].code.clone(),
            // Same key as the kept row; there is no separate row to mark.
            suppressed_codes: vec![rows[kept].code.clone(); dropped],
            duplicate_type: DuplicateType::classify(min_similarity)
                .unwrap_or(DuplicateType::Similar),
            similarity: min_similarity,
        });
    }
    if collapsed.iter().any(|&c| c) {
        let old = std::mem::take(rows);
        *rows = old
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !collapsed[*idx])
            .map(|(_, row)| row)
            .collect();
    }

    // Pass 2: cross-code twins. Blocking on exact close/volume keeps this
    // linear over roster-sized batches.
    let mut blocks: HashMap<(String, u64, u64), Vec<usize>> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let (Some(close), Some(volume)) = (row.close_price, row.volume) else {
            continue;
        };
        blocks
            .entry((
                format!("{}|{}", row.date, row.market.as_str()),
                close.to_bits(),
                volume.to_bits(),
            ))
            .or_default()
            .push(idx);
    }
    let mut blocks: Vec<_> = blocks.into_iter().filter(|(_, v)| v.len() >= 2).collect();
    blocks.sort_by(|a, b| a.0.cmp(&b.0));

    for (_, indices) in blocks {
        let kept = pick_kept_metrics(&indices, rows, strategy);
        let mut suppressed = Vec::new();
        let mut min_similarity: f64 = 1.0;
        for &idx in &indices {
            if idx == kept {
                continue;
            }
            let similarity = metrics_similarity(&rows[kept], &rows[idx]);
            if similarity >= THRESHOLD_SIMILAR {
                min_similarity = min_similarity.min(similarity);
                suppressed.push(rows[idx].code.clone());
            }
        }
        if suppressed.is_empty() {
            continue;
        }
        groups.push(MetricsDuplicateGroup {
            date: rows[kept].date,
            market: rows[kept].market,
            kept_code: rows[kept].code.clone(),
            suppressed_codes: suppressed,
            duplicate_type: DuplicateType::classify(min_similarity)
                .unwrap_or(DuplicateType::Similar),
            similarity: min_similarity,
        });
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Interval;
    use crate::quality::validation::validate_batch;

    fn bar(symbol: &str, date: &str, close: f64, volume: f64) -> OhlcvRow {
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
            volume,
            amount: None,
            ma5: None,
            ma10: None,
            ma20: None,
            ma60: None,
        }
    }

    #[test]
    fn identical_rows_are_exact_duplicates() {
        let rows = vec![
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-01", 180.0, 100.0),
        ];
        let (out, report) = deduplicate(rows, DedupStrategy::KeepFirst, None);
        assert_eq!(out.len(), 1);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].duplicate_type, DuplicateType::Exact);
        assert_eq!(report.groups[0].kept, 0);
        assert_eq!(report.groups[0].suppressed, vec![1]);
        assert_eq!(report.duplicates_suppressed, 1);
    }

    #[test]
    fn dedup_is_idempotent() {
        let rows = vec![
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-04", 181.0, 90.0),
        ];
        let (once, _) = deduplicate(rows, DedupStrategy::KeepFirst, None);
        let (twice, report) = deduplicate(once.clone(), DedupStrategy::KeepFirst, None);
        assert_eq!(once, twice);
        assert!(report.groups.is_empty());
    }

    #[test]
    fn same_key_different_values_are_partial() {
        let rows = vec![
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-01", 178.0, 95.0),
        ];
        let (_, report) = deduplicate(rows, DedupStrategy::KeepFirst, None);
        assert_eq!(report.groups.len(), 1);
        let g = &report.groups[0];
        assert!(g.similarity >= THRESHOLD_PARTIAL, "sim = {}", g.similarity);
        assert_eq!(g.duplicate_type, DuplicateType::Partial);
    }

    #[test]
    fn distinct_keys_never_group() {
        let rows = vec![
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("MSFT", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-04", 180.0, 100.0),
        ];
        let (out, report) = deduplicate(rows, DedupStrategy::KeepFirst, None);
        assert_eq!(out.len(), 3);
        assert!(report.groups.is_empty());
    }

    #[test]
    fn keep_last_picks_latest_arrival() {
        let rows = vec![
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-01", 181.0, 100.0),
        ];
        let (out, report) = deduplicate(rows, DedupStrategy::KeepLast, None);
        assert_eq!(report.groups[0].kept, 1);
        assert_eq!(out[0].close, 181.0);
    }

    #[test]
    fn keep_highest_quality_uses_reports() {
        let mut bad = bar("AAPL", "2024-03-01", 180.0, 100.0);
        bad.volume = 0.0; // warning, lowers quality score
        let good = bar("AAPL", "2024-03-01", 180.5, 100.0);
        let rows = vec![bad, good];
        let reports = validate_batch(&rows, Market::UsStock);
        let (out, report) =
            deduplicate(rows, DedupStrategy::KeepHighestQuality, Some(&reports));
        assert_eq!(report.groups[0].kept, 1);
        assert_eq!(out[0].close, 180.5);
    }

    #[test]
    fn merge_falls_back_to_highest_quality() {
        let rows = vec![
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-01", 180.0, 100.0),
        ];
        let (out, report) = deduplicate(rows, DedupStrategy::Merge, None);
        assert_eq!(out.len(), 1);
        assert_eq!(report.strategy, DedupStrategy::Merge);
    }

    #[test]
    fn survivors_keep_input_order() {
        let rows = vec![
            bar("AAPL", "2024-03-04", 181.0, 90.0),
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-01", 180.0, 100.0),
            bar("AAPL", "2024-03-05", 182.0, 80.0),
        ];
        let (out, _) = deduplicate(rows, DedupStrategy::KeepFirst, None);
        let dates: Vec<&str> = out.iter().map(|r| r.trade_date.as_str()).collect();
        assert_eq!(dates, vec!["2024-03-04", "2024-03-01", "2024-03-05"]);
    }

    fn metric(code: &str, close: f64, volume: f64, quality: f64) -> DailyMetrics {
        DailyMetrics {
            code: code.into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            market: Market::UsStock,
            close_price: Some(close),
            ma5: None,
            ma20: None,
            volume: Some(volume),
            pe_ratio: Some(20.0),
            pb_ratio: Some(3.0),
            market_cap: Some(1.0e9),
            dividend_yield: Some(1.0),
            data_source: "test".into(),
            quality_score: quality,
            validation_status: crate::models::ValidationStatus::Validated,
            is_duplicate: false,
            duplicate_source: None,
        }
    }

    #[test]
    fn same_key_metrics_collapse_to_highest_quality() {
        let mut rows = vec![
            metric("AAPL", 180.0, 100.0, 0.8),
            metric("AAPL", 180.5, 100.0, 1.0),
            metric("MSFT", 410.0, 50.0, 1.0),
        ];
        let groups = deduplicate_metrics(&mut rows, DedupStrategy::KeepHighestQuality);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].close_price, Some(180.5), "higher-quality row kept");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kept_code, "AAPL");
        // Same key as the kept row: nothing separate to mark in the store.
        assert!(groups[0].suppressed_codes.iter().all(|c| c == "AAPL"));
    }

    #[test]
    fn cross_code_twins_are_reported_not_dropped() {
        let mut rows = vec![
            metric("DUPA", 10.5, 500.0, 1.0),
            metric("DUPB", 10.5, 500.0, 1.0),
            metric("SOLO", 99.0, 123.0, 1.0),
        ];
        let groups = deduplicate_metrics(&mut rows, DedupStrategy::KeepHighestQuality);
        assert_eq!(rows.len(), 3, "cross-code twins stay in the batch");
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.suppressed_codes.len(), 1);
        assert_ne!(group.suppressed_codes[0], group.kept_code);
        assert_eq!(group.duplicate_type, DuplicateType::Similar);
        // Identical values under different codes cap out below partial.
        assert!(group.similarity >= THRESHOLD_SIMILAR);
        assert!(group.similarity < THRESHOLD_PARTIAL);
    }

    #[test]
    fn distinct_metrics_produce_no_groups() {
        let mut rows = vec![
            metric("AAPL", 180.0, 100.0, 1.0),
            metric("MSFT", 410.0, 50.0, 1.0),
        ];
        let groups = deduplicate_metrics(&mut rows, DedupStrategy::KeepHighestQuality);
        assert!(groups.is_empty());
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn metrics_dedup_is_idempotent() {
        let mut rows = vec![
            metric("AAPL", 180.0, 100.0, 0.8),
            metric("AAPL", 180.0, 100.0, 1.0),
        ];
        deduplicate_metrics(&mut rows, DedupStrategy::KeepHighestQuality);
        let again = deduplicate_metrics(&mut rows, DedupStrategy::KeepHighestQuality);
        assert!(again.is_empty());
        assert_eq!(rows.len(), 1);
    }
}
