//! Shared row normalization for every upstream source.
//!
//! Adapters parse their wire formats into [`RawBar`]s; this module turns
//! those into canonical [`OhlcvRow`]s: ascending date order, lag-derived
//! `pre_close`/`change`/`pct_chg`, `amount` synthesis and rolling moving
//! averages. Upstream sentinels (zero or non-finite prices) are treated as
//! missing before any derivation and the affected bars are discarded.

use crate::models::{Interval, OhlcvRow};

/// Source-shaped bar before derivation. Dates are already canonicalized by
/// the adapter (`YYYY-MM-DD` for daily+, ISO instant for intraday).
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
    pub trade_date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub amount: Option<f64>,
}

/// Upstream "no data" sentinels: zero or non-finite prices.
fn price_present(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

/// Rolling mean over `closes[..=idx]` with window `n`; `None` until filled.
fn rolling_mean(closes: &[f64], idx: usize, n: usize) -> Option<f64> {
    if idx + 1 < n {
        return None;
    }
    let window = &closes[idx + 1 - n..=idx];
    Some(window.iter().sum::<f64>() / n as f64)
}

/// Build canonical rows from raw bars.
///
/// Bars missing any price are dropped before derivation so sentinels never
/// poison the moving averages. Output is sorted ascending by date.
pub fn finalize_rows(symbol: &str, interval: Interval, mut bars: Vec<RawBar>) -> Vec<OhlcvRow> {
    bars.retain(|b| {
        price_present(b.open)
            && price_present(b.high)
            && price_present(b.low)
            && price_present(b.close)
            && b.volume.is_finite()
            && b.volume >= 0.0
    });
    bars.sort_by(|a, b| a.trade_date.cmp(&b.trade_date));
    bars.dedup_by(|a, b| a.trade_date == b.trade_date);

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    bars.iter()
        .enumerate()
        .map(|(idx, bar)| {
            let pre_close = if idx > 0 { Some(closes[idx - 1]) } else { None };
            let (change, pct_chg) = match pre_close {
                Some(pre) if pre > 0.0 => {
                    let change = bar.close - pre;
                    (Some(change), Some(change / pre * 100.0))
                }
                _ => (None, None),
            };
            let amount = bar
                .amount
                .filter(|a| a.is_finite() && *a > 0.0)
                .or(Some(bar.close * bar.volume));

            OhlcvRow {
                symbol: symbol.to_string(),
                interval,
                trade_date: bar.trade_date.clone(),
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                pre_close,
                change,
                pct_chg,
                volume: bar.volume,
                amount,
                ma5: rolling_mean(&closes, idx, 5),
                ma10: rolling_mean(&closes, idx, 10),
                ma20: rolling_mean(&closes, idx, 20),
                ma60: rolling_mean(&closes, idx, 60),
            }
        })
        .collect()
}

/// Recompute the moving-average columns over an already-canonical slice.
///
/// Used when rows come back out of the store: the stored slice may be a
/// superset of the requested range, so MAs are derived over the full slice
/// before any trimming.
pub fn recompute_mas(rows: &mut [OhlcvRow]) {
    let closes: Vec<f64> = rows.iter().map(|r| r.close).collect();
    for (idx, row) in rows.iter_mut().enumerate() {
        row.ma5 = rolling_mean(&closes, idx, 5);
        row.ma10 = rolling_mean(&closes, idx, 10);
        row.ma20 = rolling_mean(&closes, idx, 20);
        row.ma60 = rolling_mean(&closes, idx, 60);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(date: &str, close: f64) -> RawBar {
        RawBar {
            trade_date: date.into(),
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            amount: None,
        }
    }

    #[test]
    fn sorts_ascending_and_lags_pre_close() {
        let rows = finalize_rows(
            "AAPL",
            Interval::Daily,
            vec![raw("2024-03-04", 12.0), raw("2024-03-01", 10.0)],
        );
        assert_eq!(rows[0].trade_date, "2024-03-01");
        assert_eq!(rows[0].pre_close, None);
        assert_eq!(rows[1].pre_close, Some(10.0));
        assert_eq!(rows[1].change, Some(2.0));
        let pct = rows[1].pct_chg.unwrap();
        assert!((pct - 20.0).abs() < 1e-9);
    }

    #[test]
    fn amount_synthesized_when_missing() {
        let rows = finalize_rows("AAPL", Interval::Daily, vec![raw("2024-03-01", 10.0)]);
        assert_eq!(rows[0].amount, Some(1_000.0));

        let mut with_amount = raw("2024-03-01", 10.0);
        with_amount.amount = Some(987.0);
        let rows = finalize_rows("AAPL", Interval::Daily, vec![with_amount]);
        assert_eq!(rows[0].amount, Some(987.0));
    }

    #[test]
    fn sentinel_bars_are_dropped() {
        let mut zero_close = raw("2024-03-01", 10.0);
        zero_close.close = 0.0;
        let rows = finalize_rows(
            "AAPL",
            Interval::Daily,
            vec![zero_close, raw("2024-03-04", 11.0)],
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trade_date, "2024-03-04");
        assert_eq!(rows[0].pre_close, None, "dropped bar must not leak into lag");
    }

    #[test]
    fn moving_averages_fill_with_window() {
        let bars: Vec<RawBar> = (1..=10)
            .map(|i| raw(&format!("2024-03-{i:02}"), i as f64))
            .collect();
        let rows = finalize_rows("AAPL", Interval::Daily, bars);

        assert_eq!(rows[3].ma5, None);
        // closes 1..=5 -> mean 3
        assert_eq!(rows[4].ma5, Some(3.0));
        // closes 6..=10 -> mean 8
        assert_eq!(rows[9].ma5, Some(8.0));
        assert_eq!(rows[8].ma10, None);
        assert_eq!(rows[9].ma10, Some(5.5));
        assert_eq!(rows[9].ma20, None);
    }

    #[test]
    fn duplicate_dates_collapse() {
        let rows = finalize_rows(
            "AAPL",
            Interval::Daily,
            vec![raw("2024-03-01", 10.0), raw("2024-03-01", 10.5)],
        );
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn recompute_mas_over_store_slice() {
        let mut rows = finalize_rows(
            "AAPL",
            Interval::Daily,
            (1..=6).map(|i| raw(&format!("2024-03-{i:02}"), i as f64)).collect(),
        );
        for r in &mut rows {
            r.ma5 = None;
        }
        recompute_mas(&mut rows);
        assert_eq!(rows[4].ma5, Some(3.0));
        assert_eq!(rows[5].ma5, Some(4.0));
    }
}
