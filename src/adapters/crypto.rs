//! Crypto adapter backed by the Binance spot REST API.
//!
//! Klines come back as positional arrays with stringified prices. Crypto
//! trades around the clock, so daily+ bars are dated on the UTC calendar.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::adapters::normalize::{finalize_rows, RawBar};
use crate::adapters::{classify_status, DateRange, MarketAdapter};
use crate::errors::AdapterError;
use crate::models::{FundamentalSnapshot, Interval, Market, OhlcvRow, SpotQuote};
use crate::symbols::Symbol;

const KLINES_URL: &str = "https://api.binance.com/api/v3/klines";
const TICKER_URL: &str = "https://api.binance.com/api/v3/ticker/24hr";
const EXCHANGE_INFO_URL: &str = "https://api.binance.com/api/v3/exchangeInfo";

pub struct CryptoAdapter {
    http: reqwest::Client,
}

impl CryptoAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn binance_interval(interval: Interval) -> &'static str {
        match interval {
            Interval::Minute => "1m",
            Interval::FiveDay => "5m",
            Interval::Daily => "1d",
            Interval::Weekly => "1w",
            Interval::Monthly => "1M",
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, AdapterError> {
        let resp = self.http.get(url).query(query).send().await?;
        if let Some(err) = classify_status(&resp) {
            return Err(err);
        }
        resp.json::<Value>()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))
    }
}

fn string_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Parse a klines payload: positional arrays
/// `[open_time, open, high, low, close, volume, close_time, quote_volume, ...]`.
pub(crate) fn parse_klines_payload(
    payload: &Value,
    interval: Interval,
) -> Result<Vec<RawBar>, AdapterError> {
    let Some(rows) = payload.as_array() else {
        // Binance signals errors as an object with code/msg.
        let msg = payload
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or("klines response is not an array");
        return Err(AdapterError::Malformed(msg.to_string()));
    };

    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(fields) = row.as_array() else {
            return Err(AdapterError::Malformed("kline row is not an array".into()));
        };
        if fields.len() < 8 {
            return Err(AdapterError::Malformed("short kline row".into()));
        }
        let Some(open_ms) = fields[0].as_i64() else {
            return Err(AdapterError::Malformed("kline open time is not an int".into()));
        };
        let Some(instant) = DateTime::<Utc>::from_timestamp_millis(open_ms) else {
            continue;
        };
        let trade_date = if interval.bypasses_cache() {
            instant.to_rfc3339()
        } else {
            instant.date_naive().format("%Y-%m-%d").to_string()
        };

        let field = |idx: usize| -> Result<f64, AdapterError> {
            string_f64(fields.get(idx))
                .ok_or_else(|| AdapterError::Malformed(format!("bad kline field {idx}")))
        };

        bars.push(RawBar {
            trade_date,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
            amount: string_f64(fields.get(7)),
        });
    }
    Ok(bars)
}

pub(crate) fn parse_exchange_info(payload: &Value) -> Vec<(String, String)> {
    let Some(symbols) = payload.get("symbols").and_then(|s| s.as_array()) else {
        return Vec::new();
    };
    symbols
        .iter()
        .filter(|s| s.get("status").and_then(|v| v.as_str()) == Some("TRADING"))
        .filter(|s| s.get("quoteAsset").and_then(|v| v.as_str()) == Some("USDT"))
        .filter_map(|s| {
            let symbol = s.get("symbol")?.as_str()?;
            let base = s.get("baseAsset")?.as_str()?;
            Some((symbol.to_string(), format!("{base}/USDT")))
        })
        .collect()
}

#[async_trait]
impl MarketAdapter for CryptoAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn market(&self) -> Market {
        Market::Crypto
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
        symbol: &Symbol,
        interval: Interval,
        range: DateRange,
    ) -> Result<Vec<OhlcvRow>, AdapterError> {
        let mut query = vec![
            ("symbol", symbol.code.clone()),
            ("interval", Self::binance_interval(interval).to_string()),
            ("limit", "1000".to_string()),
        ];
        if let Some(start) = range.start {
            if let Some(start) = start.and_hms_opt(0, 0, 0) {
                query.push(("startTime", (start.and_utc().timestamp_millis()).to_string()));
            }
        }
        if let Some(end) = range.end {
            if let Some(end) = end.and_hms_opt(23, 59, 59) {
                query.push(("endTime", (end.and_utc().timestamp_millis()).to_string()));
            }
        }

        let payload = self.get_json(KLINES_URL, &query).await?;
        let bars = parse_klines_payload(&payload, interval)?;
        debug!(symbol = %symbol.code, interval = %interval, bars = bars.len(), "binance klines fetched");
        Ok(finalize_rows(&symbol.code, interval, bars))
    }

    /// No fundamentals for crypto pairs.
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
        let payload = self.get_json(TICKER_URL, &[]).await?;
        let Some(tickers) = payload.as_array() else {
            return Err(AdapterError::Malformed("ticker response is not an array".into()));
        };
        let wanted: std::collections::HashSet<&str> =
            symbols.iter().map(|s| s.as_str()).collect();
        let quotes = tickers
            .iter()
            .filter_map(|t| {
                let code = t.get("symbol")?.as_str()?;
                if !wanted.is_empty() && !wanted.contains(code) {
                    return None;
                }
                Some(SpotQuote {
                    symbol: code.to_string(),
                    price: string_f64(t.get("lastPrice"))?,
                    volume: string_f64(t.get("volume")),
                    pe_ratio: None,
                    pb_ratio: None,
                    market_cap: None,
                    dividend_yield: None,
                })
            })
            .collect();
        Ok(Some(quotes))
    }

    async fn fetch_symbol_list(&self) -> Result<Vec<(String, String)>, AdapterError> {
        let payload = self.get_json(EXCHANGE_INFO_URL, &[]).await?;
        Ok(parse_exchange_info(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_klines_with_string_prices() {
        let payload = json!([
            [1705449600000i64, "42000.0", "42500.5", "41800.0", "42300.1", "1234.5", 1705535999999i64, "52000000.0", 98765, "600.0", "25000000.0", "0"],
            [1705536000000i64, "42300.1", "43000.0", "42100.0", "42900.9", "1500.0", 1705622399999i64, "64000000.0", 87654, "700.0", "30000000.0", "0"]
        ]);
        let bars = parse_klines_payload(&payload, Interval::Daily).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].trade_date, "2024-01-17");
        assert_eq!(bars[0].close, 42300.1);
        assert_eq!(bars[0].amount, Some(52_000_000.0));
    }

    #[test]
    fn intraday_bars_keep_instants() {
        let payload = json!([
            [1705449600000i64, "42000.0", "42010.0", "41990.0", "42005.0", "10.0", 1705449659999i64, "420000.0", 10, "5.0", "210000.0", "0"]
        ]);
        let bars = parse_klines_payload(&payload, Interval::Minute).unwrap();
        assert!(bars[0].trade_date.starts_with("2024-01-17T00:00:00"));
    }

    #[test]
    fn binance_error_object_is_malformed() {
        let payload = json!({"code": -1121, "msg": "Invalid symbol."});
        let err = parse_klines_payload(&payload, Interval::Daily).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(m) if m.contains("Invalid symbol")));
    }

    #[test]
    fn exchange_info_filters_usdt_trading_pairs() {
        let payload = json!({
            "symbols": [
                { "symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT" },
                { "symbol": "ETHBTC", "status": "TRADING", "baseAsset": "ETH", "quoteAsset": "BTC" },
                { "symbol": "LUNAUSDT", "status": "BREAK", "baseAsset": "LUNA", "quoteAsset": "USDT" }
            ]
        });
        let list = parse_exchange_info(&payload);
        assert_eq!(list, vec![("BTCUSDT".to_string(), "BTC/USDT".to_string())]);
    }
}
