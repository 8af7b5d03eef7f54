//! A-share adapter backed by the Eastmoney quote API.
//!
//! Klines arrive as comma-joined strings
//! (`date,open,close,high,low,volume,amount,...`); `fltt=2` asks the API
//! for plain floats so no field scaling is needed. The list endpoint doubles
//! as the spot-batch source for the daily-metrics refresh.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::adapters::normalize::{finalize_rows, RawBar};
use crate::adapters::{classify_status, DateRange, MarketAdapter};
use crate::errors::AdapterError;
use crate::models::{FundamentalSnapshot, Interval, Market, OhlcvRow, SpotQuote};
use crate::symbols::Symbol;

const KLINE_URL: &str = "https://push2his.eastmoney.com/api/qt/stock/kline/get";
const QUOTE_URL: &str = "https://push2.eastmoney.com/api/qt/stock/get";
const LIST_URL: &str = "https://push2.eastmoney.com/api/qt/clist/get";

pub struct AShareAdapter {
    http: reqwest::Client,
}

impl AShareAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Eastmoney security id: `1.` prefix for Shanghai, `0.` otherwise.
    fn secid(symbol: &Symbol) -> String {
        let (code, exchange) = symbol
            .code
            .split_once('.')
            .unwrap_or((symbol.code.as_str(), "SZ"));
        let prefix = if exchange == "SH" { "1" } else { "0" };
        format!("{prefix}.{code}")
    }

    fn klt(interval: Interval) -> &'static str {
        match interval {
            Interval::Minute => "1",
            Interval::FiveDay => "5",
            Interval::Daily => "101",
            Interval::Weekly => "102",
            Interval::Monthly => "103",
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

/// Parse the kline payload into raw bars.
///
/// Daily+ dates come as `YYYY-MM-DD`; intraday as `YYYY-MM-DD HH:MM`, which
/// is canonicalized to an ISO instant in the exchange's +08:00 offset.
pub(crate) fn parse_kline_payload(payload: &Value) -> Result<Vec<RawBar>, AdapterError> {
    let data = payload
        .get("data")
        .filter(|d| !d.is_null())
        .ok_or_else(|| AdapterError::Malformed("kline response missing data".into()))?;

    let Some(klines) = data.get("klines").and_then(|k| k.as_array()) else {
        // A known symbol with no bars in range is an empty result.
        return Ok(Vec::new());
    };

    let mut bars = Vec::with_capacity(klines.len());
    for line in klines {
        let line = line
            .as_str()
            .ok_or_else(|| AdapterError::Malformed("kline entry is not a string".into()))?;
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 6 {
            return Err(AdapterError::Malformed(format!("short kline entry: {line}")));
        }
        let num = |idx: usize| -> Result<f64, AdapterError> {
            parts[idx]
                .parse::<f64>()
                .map_err(|_| AdapterError::Malformed(format!("bad number in kline: {line}")))
        };

        let trade_date = if parts[0].len() > 10 {
            // Intraday bar: "2024-01-18 14:30" → ISO instant in CST.
            format!("{}T{}:00+08:00", &parts[0][..10], &parts[0][11..])
        } else {
            parts[0].to_string()
        };

        bars.push(RawBar {
            trade_date,
            open: num(1)?,
            close: num(2)?,
            high: num(3)?,
            low: num(4)?,
            volume: num(5)?,
            amount: parts.get(6).and_then(|s| s.parse::<f64>().ok()),
        });
    }
    Ok(bars)
}

fn value_f64(v: Option<&Value>) -> Option<f64> {
    v.and_then(Value::as_f64).filter(|x| x.is_finite())
}

pub(crate) fn parse_fundamental_payload(
    symbol: &str,
    payload: &Value,
) -> Option<FundamentalSnapshot> {
    let data = payload.get("data").filter(|d| !d.is_null())?;
    Some(FundamentalSnapshot {
        symbol: symbol.to_string(),
        market_cap: value_f64(data.get("f116")),
        pe_ratio: value_f64(data.get("f162")),
        pb_ratio: value_f64(data.get("f167")),
        dividend_yield: value_f64(data.get("f126")),
        gross_margin: value_f64(data.get("f49")),
        net_margin: value_f64(data.get("f129")),
        revenue_growth: value_f64(data.get("f183")),
        profit_growth: value_f64(data.get("f184")),
        debt_to_assets: value_f64(data.get("f188")),
        current_ratio: value_f64(data.get("f190")),
        last_updated: Utc::now(),
    })
}

/// Row shape shared by the roster and spot-batch parses.
pub(crate) struct ClistRow {
    pub code: String,
    pub name: String,
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub market_cap: Option<f64>,
}

pub(crate) fn parse_clist_payload(payload: &Value) -> Result<Vec<ClistRow>, AdapterError> {
    let data = payload
        .get("data")
        .filter(|d| !d.is_null())
        .ok_or_else(|| AdapterError::Malformed("clist response missing data".into()))?;
    let Some(diff) = data.get("diff").and_then(|d| d.as_array()) else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::with_capacity(diff.len());
    for item in diff {
        let Some(raw_code) = item.get("f12").and_then(|v| v.as_str()) else {
            continue;
        };
        // f13 is the exchange flag: 1 = Shanghai, otherwise Shenzhen/Beijing.
        let exchange = match item.get("f13").and_then(Value::as_i64) {
            Some(1) => "SH",
            _ => match raw_code.as_bytes().first() {
                Some(b'4') | Some(b'8') => "BJ",
                _ => "SZ",
            },
        };
        rows.push(ClistRow {
            code: format!("{raw_code}.{exchange}"),
            name: item
                .get("f14")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            price: value_f64(item.get("f2")),
            volume: value_f64(item.get("f5")),
            pe_ratio: value_f64(item.get("f9")),
            pb_ratio: value_f64(item.get("f23")),
            market_cap: value_f64(item.get("f20")),
        });
    }
    Ok(rows)
}

#[async_trait]
impl MarketAdapter for AShareAdapter {
    fn name(&self) -> &'static str {
        "eastmoney"
    }

    fn market(&self) -> Market {
        Market::AShare
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
        let beg = range
            .start
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "19900101".to_string());
        let end = range
            .end
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "20500101".to_string());

        let query = [
            ("secid", Self::secid(symbol)),
            ("klt", Self::klt(interval).to_string()),
            ("fqt", "1".to_string()),
            ("beg", beg),
            ("end", end),
            ("fields1", "f1,f2,f3,f4,f5,f6".to_string()),
            ("fields2", "f51,f52,f53,f54,f55,f56,f57".to_string()),
        ];
        let payload = self.get_json(KLINE_URL, &query).await?;
        let bars = parse_kline_payload(&payload)?;
        debug!(symbol = %symbol.code, interval = %interval, bars = bars.len(), "eastmoney klines fetched");
        Ok(finalize_rows(&symbol.code, interval, bars))
    }

    async fn fetch_fundamentals(
        &self,
        symbol: &Symbol,
    ) -> Result<Option<FundamentalSnapshot>, AdapterError> {
        let query = [
            ("secid", Self::secid(symbol)),
            ("fltt", "2".to_string()),
            ("invt", "2".to_string()),
            (
                "fields",
                "f116,f162,f167,f126,f49,f129,f183,f184,f188,f190".to_string(),
            ),
        ];
        let payload = self.get_json(QUOTE_URL, &query).await?;
        Ok(parse_fundamental_payload(&symbol.code, &payload))
    }

    async fn fetch_spot_batch(
        &self,
        symbols: &[String],
    ) -> Result<Option<Vec<SpotQuote>>, AdapterError> {
        let rows = self.fetch_roster().await?;
        let wanted: std::collections::HashSet<&str> =
            symbols.iter().map(|s| s.as_str()).collect();
        let quotes = rows
            .into_iter()
            .filter(|r| wanted.is_empty() || wanted.contains(r.code.as_str()))
            .filter_map(|r| {
                Some(SpotQuote {
                    symbol: r.code.clone(),
                    price: r.price?,
                    volume: r.volume,
                    pe_ratio: r.pe_ratio,
                    pb_ratio: r.pb_ratio,
                    market_cap: r.market_cap,
                    dividend_yield: None,
                })
            })
            .collect();
        Ok(Some(quotes))
    }

    async fn fetch_symbol_list(&self) -> Result<Vec<(String, String)>, AdapterError> {
        let rows = self.fetch_roster().await?;
        Ok(rows.into_iter().map(|r| (r.code, r.name)).collect())
    }
}

impl AShareAdapter {
    async fn fetch_roster(&self) -> Result<Vec<ClistRow>, AdapterError> {
        let query = [
            ("pn", "1".to_string()),
            ("pz", "6000".to_string()),
            ("po", "1".to_string()),
            ("fltt", "2".to_string()),
            ("invt", "2".to_string()),
            // Main boards + STAR + ChiNext + Beijing.
            ("fs", "m:0+t:6,m:0+t:80,m:1+t:2,m:1+t:23,m:0+t:81+s:2048".to_string()),
            ("fields", "f2,f5,f9,f12,f13,f14,f20,f23".to_string()),
        ];
        let payload = self.get_json(LIST_URL, &query).await?;
        parse_clist_payload(&payload)
    }
}
