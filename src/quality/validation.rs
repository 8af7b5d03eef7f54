//! Row-level validation rules.
//!
//! The stage never mutates or drops rows; it grades them. A row is valid
//! iff it produced zero errors. Downstream decides what to do with invalid
//! rows: the OHLCV ingest keeps them, and the daily-metrics writer keeps
//! them too while recording `validation_status = failed` on the stored row
//! so backfills stay observable.

use lazy_static::lazy_static;
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;

use crate::models::{DailyMetrics, Market, OhlcvRow};

lazy_static! {
    static ref A_SHARE_CODE_RE: Regex = Regex::new(r"^[0-9]{6}\.(SH|SZ|BJ)$").unwrap();
    static ref US_CODE_RE: Regex = Regex::new(r"^[A-Z]{1,5}(\.[A-Z])?$").unwrap();
    static ref HK_CODE_RE: Regex = Regex::new(r"^[0-9]{5}$").unwrap();
    static ref DAILY_DATE_RE: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap();
}

pub const MIN_PRICE: f64 = 0.01;
pub const MAX_PRICE: f64 = 10_000.0;
pub const MAX_VOLUME: f64 = 1e12;
/// A-share daily limit; other markets treat breaches as warnings only.
pub const MAX_CHANGE_PERCENT: f64 = 10.0;

const ERROR_DEDUCTION: f64 = 0.2;
const WARNING_DEDUCTION: f64 = 0.1;

/// Outcome of validating one row.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub symbol: String,
    pub trade_date: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub quality_score: f64,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn code_matches_market(symbol: &str, market: Market) -> bool {
    match market {
        Market::AShare => A_SHARE_CODE_RE.is_match(symbol),
        Market::UsStock => US_CODE_RE.is_match(symbol),
        Market::HkStock => HK_CODE_RE.is_match(symbol),
        // Crypto and futures grammars are open-ended upstream; anything
        // non-empty that survived resolution passes here.
        Market::Crypto | Market::Futures => !symbol.is_empty(),
    }
}

fn check_price(field: &str, value: f64, errors: &mut Vec<String>) {
    if !value.is_finite() {
        errors.push(format!("{field} is not a finite number"));
    } else if value < MIN_PRICE {
        errors.push(format!("{field} {value} below minimum {MIN_PRICE}"));
    } else if value > MAX_PRICE {
        errors.push(format!("{field} {value} above maximum {MAX_PRICE}"));
    }
}

/// Validate a single row against the rule set for its market.
pub fn validate_row(row: &OhlcvRow, market: Market) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if row.symbol.trim().is_empty() {
        errors.push("symbol is empty".to_string());
    } else if !code_matches_market(&row.symbol, market) {
        errors.push(format!(
            "symbol {} does not match {} grammar",
            row.symbol,
            market.as_str()
        ));
    }

    if row.trade_date.trim().is_empty() {
        errors.push("trade_date is empty".to_string());
    } else if !DAILY_DATE_RE.is_match(&row.trade_date) {
        errors.push(format!("trade_date {} is not parseable", row.trade_date));
    }

    check_price("open", row.open, &mut errors);
    check_price("high", row.high, &mut errors);
    check_price("low", row.low, &mut errors);
    check_price("close", row.close, &mut errors);

    if !row.price_shape_ok() {
        errors.push(format!(
            "price relationship violated: low {} open {} close {} high {}",
            row.low, row.open, row.close, row.high
        ));
    }

    if row.volume < 0.0 {
        errors.push(format!("volume {} is negative", row.volume));
    } else if row.volume > MAX_VOLUME {
        errors.push(format!("volume {} above maximum {MAX_VOLUME}", row.volume));
    } else if row.volume == 0.0 {
        warnings.push("volume is zero".to_string());
    }

    if let Some(pct) = row.pct_chg {
        if pct.abs() > MAX_CHANGE_PERCENT {
            let msg = format!("pct_chg {pct:.2} beyond daily limit {MAX_CHANGE_PERCENT}");
            if market == Market::AShare {
                errors.push(msg);
            } else {
                warnings.push(msg);
            }
        }
        if let Some(pre) = row.pre_close {
            if pre > 0.0 {
                let expected = (row.close - pre) / pre * 100.0;
                if (pct - expected).abs() > 1e-4 {
                    warnings.push(format!(
                        "pct_chg {pct:.4} inconsistent with close/pre_close (expected {expected:.4})"
                    ));
                }
            }
        }
    }

    let quality_score = (1.0
        - ERROR_DEDUCTION * errors.len() as f64
        - WARNING_DEDUCTION * warnings.len() as f64)
        .max(0.0);

    ValidationReport {
        symbol: row.symbol.clone(),
        trade_date: row.trade_date.clone(),
        errors,
        warnings,
        quality_score,
    }
}

/// Validate a batch in parallel. Output order matches input order.
pub fn validate_batch(rows: &[OhlcvRow], market: Market) -> Vec<ValidationReport> {
    rows.par_iter().map(|r| validate_row(r, market)).collect()
}

/// Validate a derived daily-metrics row (spot-quote shaped).
///
/// The date is already typed, so only the value rules apply: code grammar,
/// price range, volume range, and ratio sanity. Negative valuation ratios
/// are warnings (loss-making issuers legitimately carry a negative PE);
/// a negative market cap or price is an error.
pub fn validate_metrics_row(row: &DailyMetrics) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if row.code.trim().is_empty() {
        errors.push("code is empty".to_string());
    } else if !code_matches_market(&row.code, row.market) {
        errors.push(format!(
            "code {} does not match {} grammar",
            row.code,
            row.market.as_str()
        ));
    }

    match row.close_price {
        Some(price) => check_price("close_price", price, &mut errors),
        None => errors.push("close_price missing".to_string()),
    }

    match row.volume {
        Some(v) if v < 0.0 => errors.push(format!("volume {v} is negative")),
        Some(v) if v > MAX_VOLUME => {
            errors.push(format!("volume {v} above maximum {MAX_VOLUME}"))
        }
        Some(v) if v == 0.0 => warnings.push("volume is zero".to_string()),
        Some(_) => {}
        None => warnings.push("volume missing".to_string()),
    }

    if let Some(pe) = row.pe_ratio {
        if pe < 0.0 {
            warnings.push(format!("pe_ratio {pe} is negative"));
        }
    }
    if let Some(pb) = row.pb_ratio {
        if pb < 0.0 {
            warnings.push(format!("pb_ratio {pb} is negative"));
        }
    }
    if let Some(mcap) = row.market_cap {
        if mcap < 0.0 {
            errors.push(format!("market_cap {mcap} is negative"));
        }
    }
    if let Some(yield_pct) = row.dividend_yield {
        if yield_pct < 0.0 {
            warnings.push(format!("dividend_yield {yield_pct} is negative"));
        }
    }

    let quality_score = (1.0
        - ERROR_DEDUCTION * errors.len() as f64
        - WARNING_DEDUCTION * warnings.len() as f64)
        .max(0.0);

    ValidationReport {
        symbol: row.code.clone(),
        trade_date: row.date.format("%Y-%m-%d").to_string(),
        errors,
        warnings,
        quality_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Interval;

    fn good_row() -> OhlcvRow {
        OhlcvRow {
            symbol: "000001.SZ".into(),
            interval: Interval::Daily,
            trade_date: "2024-01-18".into(),
            open: 10.0,
            high: 10.5,
            low: 9.8,
            close: 10.2,
            pre_close: Some(10.0),
            change: Some(0.2),
            pct_chg: Some(2.0),
            volume: 1_000_000.0,
            amount: Some(10_200_000.0),
            ma5: None,
            ma10: None,
            ma20: None,
            ma60: None,
        }
    }

    #[test]
    fn clean_row_scores_one() {
        let report = validate_row(&good_row(), Market::AShare);
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
        assert_eq!(report.quality_score, 1.0);
    }

    #[test]
    fn price_out_of_range_is_error() {
        let mut row = good_row();
        row.close = 0.001;
        row.low = 0.001;
        let report = validate_row(&row, Market::AShare);
        assert!(!report.is_valid());
        assert!(report.quality_score < 1.0);
    }

    #[test]
    fn symbol_grammar_is_market_specific() {
        let mut row = good_row();
        row.symbol = "AAPL".into();
        assert!(!validate_row(&row, Market::AShare).is_valid());
        // Same code is fine for the US grammar (pct limit downgraded there).
        let report = validate_row(&row, Market::UsStock);
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }

    #[test]
    fn a_share_limit_breach_is_error_us_is_warning() {
        let mut row = good_row();
        row.pct_chg = Some(14.0);
        assert!(!validate_row(&row, Market::AShare).is_valid());

        row.symbol = "TSLA".into();
        let report = validate_row(&row, Market::UsStock);
        assert!(report.is_valid());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn score_deductions_follow_weights() {
        let mut row = good_row();
        row.volume = 0.0; // one warning
        let report = validate_row(&row, Market::AShare);
        assert!(report.is_valid());
        assert!((report.quality_score - 0.9).abs() < 1e-9);

        row.low = 11.0; // price relationship error on top
        let report = validate_row(&row, Market::AShare);
        assert!((report.quality_score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn score_floors_at_zero() {
        let row = OhlcvRow {
            symbol: "".into(),
            interval: Interval::Daily,
            trade_date: "bogus".into(),
            open: -1.0,
            high: -2.0,
            low: 5.0,
            close: 1e9,
            pre_close: Some(1.0),
            change: None,
            pct_chg: Some(500.0),
            volume: -5.0,
            amount: None,
            ma5: None,
            ma10: None,
            ma20: None,
            ma60: None,
        };
        let report = validate_row(&row, Market::AShare);
        assert!(!report.is_valid());
        assert_eq!(report.quality_score, 0.0);
    }

    #[test]
    fn batch_preserves_order() {
        let rows = vec![good_row(), good_row()];
        let reports = validate_batch(&rows, Market::AShare);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].trade_date, rows[0].trade_date);
    }

    fn good_metrics() -> DailyMetrics {
        DailyMetrics {
            code: "600519.SH".into(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            market: Market::AShare,
            close_price: Some(1700.0),
            ma5: None,
            ma20: None,
            volume: Some(32_000.0),
            pe_ratio: Some(30.0),
            pb_ratio: Some(9.0),
            market_cap: Some(2.1e12),
            dividend_yield: Some(1.4),
            data_source: "eastmoney".into(),
            quality_score: 0.0,
            validation_status: crate::models::ValidationStatus::Pending,
            is_duplicate: false,
            duplicate_source: None,
        }
    }

    #[test]
    fn clean_metrics_row_scores_one() {
        let report = validate_metrics_row(&good_metrics());
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
        assert_eq!(report.quality_score, 1.0);
    }

    #[test]
    fn metrics_price_and_volume_rules() {
        let mut row = good_metrics();
        row.close_price = Some(-5.0);
        assert!(!validate_metrics_row(&row).is_valid());

        let mut row = good_metrics();
        row.close_price = None;
        assert!(!validate_metrics_row(&row).is_valid());

        let mut row = good_metrics();
        row.volume = Some(-1.0);
        assert!(!validate_metrics_row(&row).is_valid());

        let mut row = good_metrics();
        row.volume = Some(0.0);
        let report = validate_metrics_row(&row);
        assert!(report.is_valid());
        assert!((report.quality_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn metrics_code_grammar_follows_market() {
        let mut row = good_metrics();
        row.code = "AAPL".into();
        assert!(!validate_metrics_row(&row).is_valid());
        row.market = Market::UsStock;
        assert!(validate_metrics_row(&row).is_valid());
    }

    #[test]
    fn negative_pe_is_a_warning_negative_mcap_is_an_error() {
        let mut row = good_metrics();
        row.pe_ratio = Some(-12.0);
        let report = validate_metrics_row(&row);
        assert!(report.is_valid());
        assert!(!report.warnings.is_empty());

        row.market_cap = Some(-1.0);
        assert!(!validate_metrics_row(&row).is_valid());
    }
}
