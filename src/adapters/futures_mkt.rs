//! Chinese futures adapter backed by the Sina futures kline API.
//!
//! Daily klines only; the exchanges publish no fundamentals for contracts.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::adapters::normalize::{finalize_rows, RawBar};
use crate::adapters::{classify_status, DateRange, MarketAdapter};
use crate::errors::AdapterError;
use crate::models::{FundamentalSnapshot, Interval, Market, OhlcvRow};
use crate::symbols::Symbol;

const DAILY_KLINE_URL: &str =
    "https://stock2.finance.sina.com.cn/futures/api/json.php/IndexService.getInnerFuturesDailyKLine";

pub struct FuturesAdapter {
    http: reqwest::Client,
}

impl FuturesAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn field_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Parse the Sina daily kline payload.
///
/// The service has shipped two shapes over time: an array of objects
/// (`{"d": date, "o": .., "h": .., "l": .., "c": .., "v": ..}`) and a
/// positional array-of-arrays. Both are accepted.
pub(crate) fn parse_sina_klines(payload: &Value) -> Result<Vec<RawBar>, AdapterError> {
    let Some(rows) = payload.as_array() else {
        return Err(AdapterError::Malformed("futures kline response is not an array".into()));
    };

    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        let bar = match row {
            Value::Object(obj) => {
                let date = obj
                    .get("d")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AdapterError::Malformed("futures kline missing date".into()))?;
                let num = |key: &str| -> Result<f64, AdapterError> {
                    obj.get(key).and_then(field_f64).ok_or_else(|| {
                        AdapterError::Malformed(format!("futures kline missing {key}"))
                    })
                };
                RawBar {
                    trade_date: date.to_string(),
                    open: num("o")?,
                    high: num("h")?,
                    low: num("l")?,
                    close: num("c")?,
                    volume: num("v")?,
                    amount: None,
                }
            }
            Value::Array(fields) if fields.len() >= 6 => {
                let date = fields[0]
                    .as_str()
                    .ok_or_else(|| AdapterError::Malformed("futures kline missing date".into()))?;
                let num = |idx: usize| -> Result<f64, AdapterError> {
                    fields.get(idx).and_then(field_f64).ok_or_else(|| {
                        AdapterError::Malformed(format!("bad futures kline field {idx}"))
                    })
                };
                RawBar {
                    trade_date: date.to_string(),
                    open: num(1)?,
                    high: num(2)?,
                    low: num(3)?,
                    close: num(4)?,
                    volume: num(5)?,
                    amount: None,
                }
            }
            _ => return Err(AdapterError::Malformed("unrecognized futures kline row".into())),
        };
        bars.push(bar);
    }
    Ok(bars)
}

#[async_trait]
impl MarketAdapter for FuturesAdapter {
    fn name(&self) -> &'static str {
        "sina-futures"
    }

    fn market(&self) -> Market {
        Market::Futures
    }

    fn supported_intervals(&self) -> &'static [Interval] {
        &[Interval::Daily]
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &Symbol,
        interval: Interval,
        range: DateRange,
    ) -> Result<Vec<OhlcvRow>, AdapterError> {
        let resp = self
            .http
            .get(DAILY_KLINE_URL)
            .query(&[("symbol", symbol.code.as_str())])
            .send()
            .await?;
        if let Some(err) = classify_status(&resp) {
            return Err(err);
        }
        let payload = resp
            .json::<Value>()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;

        let mut bars = parse_sina_klines(&payload)?;
        // The endpoint has no server-side range filter.
        if let Some(start) = range.start {
            let start = start.format("%Y-%m-%d").to_string();
            bars.retain(|b| b.trade_date.as_str() >= start.as_str());
        }
        if let Some(end) = range.end {
            let end = end.format("%Y-%m-%d").to_string();
            bars.retain(|b| b.trade_date.as_str() <= end.as_str());
        }

        debug!(symbol = %symbol.code, interval = %interval, bars = bars.len(), "sina futures klines fetched");
        Ok(finalize_rows(&symbol.code, interval, bars))
    }

    /// Futures contracts carry no issuer fundamentals.
    async fn fetch_fundamentals(
        &self,
        _symbol: &Symbol,
    ) -> Result<Option<FundamentalSnapshot>, AdapterError> {
        Ok(None)
    }
}
