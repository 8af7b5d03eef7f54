//! US equities adapter backed by the Yahoo Finance chart and quote-summary
//! APIs, plus the exchange-roster bootstrap.
//!
//! Daily+ bars are dated in the exchange's calendar (America/New_York), so
//! a close stamped late UTC still lands on the right trading day. The
//! symbol-list bootstrap walks its sources in a fixed order: index
//! constituents are mandatory, exchange listings and the curated fallback
//! are best-effort.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::America::New_York;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::adapters::normalize::{finalize_rows, RawBar};
use crate::adapters::{classify_status, DateRange, MarketAdapter};
use crate::errors::AdapterError;
use crate::models::{
    ActionType, AnnualEarnings, CorporateAction, FundamentalSnapshot, Interval, Market, OhlcvRow,
};
use crate::symbols::Symbol;

const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const SUMMARY_URL: &str = "https://query1.finance.yahoo.com/v10/finance/quoteSummary";
const CONSTITUENTS_URL: &str =
    "https://raw.githubusercontent.com/datasets/s-and-p-500-companies/main/data/constituents.csv";
const NASDAQ_LISTED_URL: &str =
    "https://www.nasdaqtrader.com/dynamic/SymDir/nasdaqlisted.txt";
const OTHER_LISTED_URL: &str = "https://www.nasdaqtrader.com/dynamic/SymDir/otherlisted.txt";

/// Last line of defense when both live roster sources are down.
const CURATED_FALLBACK: &[(&str, &str)] = &[
    ("AAPL", "Apple Inc."),
    ("MSFT", "Microsoft Corporation"),
    ("GOOGL", "Alphabet Inc."),
    ("AMZN", "Amazon.com Inc."),
    ("NVDA", "NVIDIA Corporation"),
    ("META", "Meta Platforms Inc."),
    ("TSLA", "Tesla Inc."),
    ("BRK.B", "Berkshire Hathaway Inc."),
    ("JPM", "JPMorgan Chase & Co."),
    ("V", "Visa Inc."),
    ("UNH", "UnitedHealth Group Inc."),
    ("XOM", "Exxon Mobil Corporation"),
    ("JNJ", "Johnson & Johnson"),
    ("WMT", "Walmart Inc."),
    ("PG", "Procter & Gamble Co."),
    ("MA", "Mastercard Inc."),
    ("HD", "Home Depot Inc."),
    ("KO", "Coca-Cola Co."),
    ("PEP", "PepsiCo Inc."),
    ("COST", "Costco Wholesale Corp."),
];

pub struct UsStockAdapter {
    http: reqwest::Client,
}

impl UsStockAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn yahoo_interval(interval: Interval) -> &'static str {
        match interval {
            Interval::Minute => "1m",
            Interval::FiveDay => "5m",
            Interval::Daily => "1d",
            Interval::Weekly => "1wk",
            Interval::Monthly => "1mo",
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

    async fn get_text(&self, url: &str) -> Result<String, AdapterError> {
        let resp = self.http.get(url).send().await?;
        if let Some(err) = classify_status(&resp) {
            return Err(err);
        }
        resp.text()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))
    }
}

/// Format a unix timestamp as the canonical trade date for the interval.
fn canonical_date(ts: i64, interval: Interval) -> Option<String> {
    let instant = DateTime::<Utc>::from_timestamp(ts, 0)?;
    if interval.bypasses_cache() {
        Some(instant.to_rfc3339())
    } else {
        // Date the bar in the exchange's calendar, not UTC.
        Some(
            instant
                .with_timezone(&New_York)
                .date_naive()
                .format("%Y-%m-%d")
                .to_string(),
        )
    }
}

/// Parse the chart payload into raw bars plus corporate-action events.
pub(crate) fn parse_chart_payload(
    payload: &Value,
    symbol: &str,
    interval: Interval,
) -> Result<(Vec<RawBar>, Vec<CorporateAction>), AdapterError> {
    let result = payload
        .pointer("/chart/result/0")
        .ok_or_else(|| AdapterError::Malformed("chart response missing result".into()))?;

    let Some(timestamps) = result.get("timestamp").and_then(|t| t.as_array()) else {
        return Ok((Vec::new(), Vec::new()));
    };
    let quote = result
        .pointer("/indicators/quote/0")
        .ok_or_else(|| AdapterError::Malformed("chart response missing quote block".into()))?;

    let series = |name: &str| -> Vec<Option<f64>> {
        quote
            .get(name)
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(Value::as_f64).collect())
            .unwrap_or_default()
    };
    let opens = series("open");
    let highs = series("high");
    let lows = series("low");
    let closes = series("close");
    let volumes = series("volume");

    let mut bars = Vec::with_capacity(timestamps.len());
    for (idx, ts) in timestamps.iter().enumerate() {
        let Some(ts) = ts.as_i64() else { continue };
        let Some(trade_date) = canonical_date(ts, interval) else {
            continue;
        };
        // Yahoo pads null slots for halted sessions; skip them.
        let (Some(open), Some(high), Some(low), Some(close)) = (
            opens.get(idx).copied().flatten(),
            highs.get(idx).copied().flatten(),
            lows.get(idx).copied().flatten(),
            closes.get(idx).copied().flatten(),
        ) else {
            continue;
        };
        bars.push(RawBar {
            trade_date,
            open,
            high,
            low,
            close,
            volume: volumes.get(idx).copied().flatten().unwrap_or(0.0),
            amount: None,
        });
    }

    let mut actions = Vec::new();
    if let Some(dividends) = result.pointer("/events/dividends").and_then(|d| d.as_object()) {
        for event in dividends.values() {
            if let (Some(date), Some(amount)) = (
                event.get("date").and_then(Value::as_i64),
                event.get("amount").and_then(Value::as_f64),
            ) {
                if let Some(instant) = DateTime::<Utc>::from_timestamp(date, 0) {
                    actions.push(CorporateAction {
                        symbol: symbol.to_string(),
                        ex_date: instant.with_timezone(&New_York).date_naive(),
                        action_type: ActionType::Dividend,
                        value: amount,
                    });
                }
            }
        }
    }
    if let Some(splits) = result.pointer("/events/splits").and_then(|s| s.as_object()) {
        for event in splits.values() {
            let date = event.get("date").and_then(Value::as_i64);
            let numerator = event.get("numerator").and_then(Value::as_f64);
            let denominator = event.get("denominator").and_then(Value::as_f64);
            if let (Some(date), Some(num), Some(den)) = (date, numerator, denominator) {
                if den > 0.0 {
                    if let Some(instant) = DateTime::<Utc>::from_timestamp(date, 0) {
                        actions.push(CorporateAction {
                            symbol: symbol.to_string(),
                            ex_date: instant.with_timezone(&New_York).date_naive(),
                            action_type: ActionType::Split,
                            value: num / den,
                        });
                    }
                }
            }
        }
    }
    actions.sort_by_key(|a| a.ex_date);

    Ok((bars, actions))
}

fn raw_field(v: &Value, pointer: &str) -> Option<f64> {
    v.pointer(pointer)
        .and_then(|f| f.get("raw"))
        .and_then(Value::as_f64)
        .filter(|x| x.is_finite())
}

pub(crate) fn parse_quote_summary(symbol: &str, payload: &Value) -> Option<FundamentalSnapshot> {
    let result = payload.pointer("/quoteSummary/result/0")?;
    Some(FundamentalSnapshot {
        symbol: symbol.to_string(),
        market_cap: raw_field(result, "/summaryDetail/marketCap"),
        pe_ratio: raw_field(result, "/summaryDetail/trailingPE"),
        pb_ratio: raw_field(result, "/defaultKeyStatistics/priceToBook"),
        dividend_yield: raw_field(result, "/summaryDetail/dividendYield").map(|y| y * 100.0),
        gross_margin: raw_field(result, "/financialData/grossMargins").map(|m| m * 100.0),
        net_margin: raw_field(result, "/financialData/profitMargins").map(|m| m * 100.0),
        revenue_growth: raw_field(result, "/financialData/revenueGrowth").map(|g| g * 100.0),
        profit_growth: raw_field(result, "/financialData/earningsGrowth").map(|g| g * 100.0),
        debt_to_assets: raw_field(result, "/financialData/debtToEquity"),
        current_ratio: raw_field(result, "/financialData/currentRatio"),
        last_updated: Utc::now(),
    })
}

pub(crate) fn parse_income_history(symbol: &str, payload: &Value) -> Vec<AnnualEarnings> {
    let Some(statements) = payload
        .pointer("/quoteSummary/result/0/incomeStatementHistory/incomeStatementHistory")
        .and_then(|v| v.as_array())
    else {
        return Vec::new();
    };

    let mut earnings: Vec<AnnualEarnings> = statements
        .iter()
        .filter_map(|stmt| {
            let end = stmt.pointer("/endDate/fmt")?.as_str()?;
            let year: i32 = end.get(..4)?.parse().ok()?;
            let net_profit = stmt.pointer("/netIncome/raw")?.as_f64()?;
            Some(AnnualEarnings {
                symbol: symbol.to_string(),
                year,
                net_profit,
            })
        })
        .collect();
    earnings.sort_by_key(|e| e.year);
    earnings
}

/// Share classes with a structural suffix (warrants, rights, preferred,
/// bankruptcy) are excluded from the roster.
pub(crate) fn roster_symbol_ok(symbol: &str) -> bool {
    if symbol.len() > 4 {
        !matches!(symbol.as_bytes()[symbol.len() - 1], b'W' | b'R' | b'P' | b'Q')
    } else {
        true
    }
}

/// Parse a nasdaqtrader pipe-separated listing file.
pub(crate) fn parse_listing_file(body: &str) -> Vec<(String, String)> {
    body.lines()
        .skip(1) // header
        .filter(|line| !line.starts_with("File Creation Time"))
        .filter_map(|line| {
            let mut parts = line.split('|');
            let symbol = parts.next()?.trim();
            let name = parts.next()?.trim();
            if symbol.is_empty() || name.is_empty() {
                return None;
            }
            // Test issues are flagged in the third column of both files.
            Some((symbol.to_string(), name.to_string()))
        })
        .collect()
}

pub(crate) fn parse_constituents_csv(body: &str) -> Vec<(String, String)> {
    body.lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.splitn(3, ',');
            let symbol = parts.next()?.trim().trim_matches('"');
            let name = parts.next()?.trim().trim_matches('"');
            if symbol.is_empty() {
                return None;
            }
            Some((symbol.to_string(), name.to_string()))
        })
        .collect()
}

#[async_trait]
impl MarketAdapter for UsStockAdapter {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    fn market(&self) -> Market {
        Market::UsStock
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
        let mut query = vec![(
            "interval",
            Self::yahoo_interval(interval).to_string(),
        )];
        match (range.start, range.end) {
            (Some(start), end) => {
                let p1 = start.and_hms_opt(0, 0, 0).map(|d| d.and_utc().timestamp());
                let p2 = end
                    .and_then(|d| d.and_hms_opt(23, 59, 59))
                    .map(|d| d.and_utc().timestamp())
                    .unwrap_or_else(|| Utc::now().timestamp());
                if let Some(p1) = p1 {
                    query.push(("period1", p1.to_string()));
                    query.push(("period2", p2.to_string()));
                }
            }
            _ => {
                let span = if interval.bypasses_cache() { "5d" } else { "10y" };
                query.push(("range", span.to_string()));
            }
        }

        let url = format!("{CHART_URL}/{}", symbol.code);
        let payload = self.get_json(&url, &query).await?;
        let (bars, _) = parse_chart_payload(&payload, &symbol.code, interval)?;
        debug!(symbol = %symbol.code, interval = %interval, bars = bars.len(), "yahoo chart fetched");
        Ok(finalize_rows(&symbol.code, interval, bars))
    }

    async fn fetch_fundamentals(
        &self,
        symbol: &Symbol,
    ) -> Result<Option<FundamentalSnapshot>, AdapterError> {
        let url = format!("{SUMMARY_URL}/{}", symbol.code);
        let query = [(
            "modules",
            "summaryDetail,defaultKeyStatistics,financialData".to_string(),
        )];
        let payload = self.get_json(&url, &query).await?;
        Ok(parse_quote_summary(&symbol.code, &payload))
    }

    async fn fetch_corporate_actions(
        &self,
        symbol: &Symbol,
    ) -> Result<Vec<CorporateAction>, AdapterError> {
        let url = format!("{CHART_URL}/{}", symbol.code);
        let query = [
            ("interval", "1d".to_string()),
            ("range", "10y".to_string()),
            ("events", "div|split".to_string()),
        ];
        let payload = self.get_json(&url, &query).await?;
        let (_, actions) = parse_chart_payload(&payload, &symbol.code, Interval::Daily)?;
        Ok(actions)
    }

    async fn fetch_annual_earnings(
        &self,
        symbol: &Symbol,
    ) -> Result<Vec<AnnualEarnings>, AdapterError> {
        let url = format!("{SUMMARY_URL}/{}", symbol.code);
        let query = [("modules", "incomeStatementHistory".to_string())];
        let payload = self.get_json(&url, &query).await?;
        Ok(parse_income_history(&symbol.code, &payload))
    }

    /// Bootstrap the US roster: index constituents (mandatory) → exchange
    /// listings (best-effort) → curated fallback, unioned then filtered.
    async fn fetch_symbol_list(&self) -> Result<Vec<(String, String)>, AdapterError> {
        let mut roster: BTreeMap<String, String> = BTreeMap::new();

        // Source 1: index constituents. Failure here aborts the bootstrap.
        let constituents = self.get_text(CONSTITUENTS_URL).await?;
        let parsed = parse_constituents_csv(&constituents);
        if parsed.is_empty() {
            return Err(AdapterError::Malformed(
                "constituents source returned no symbols".into(),
            ));
        }
        for (code, name) in parsed {
            roster.entry(code).or_insert(name);
        }

        // Source 2: exchange listings; a failure only narrows coverage.
        for url in [NASDAQ_LISTED_URL, OTHER_LISTED_URL] {
            match self.get_text(url).await {
                Ok(body) => {
                    for (code, name) in parse_listing_file(&body) {
                        roster.entry(code).or_insert(name);
                    }
                }
                Err(e) => warn!(url, error = %e, "exchange listing source unavailable"),
            }
        }

        // Source 3: curated floor so the roster is never unusably small.
        for (code, name) in CURATED_FALLBACK {
            roster.entry((*code).to_string()).or_insert((*name).to_string());
        }

        Ok(roster
            .into_iter()
            .filter(|(code, _)| roster_symbol_ok(code))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chart_payload() -> Value {
        json!({
            "chart": { "result": [ {
                "timestamp": [1705500000, 1705586400],
                "indicators": { "quote": [ {
                    "open":   [185.0, 186.2],
                    "high":   [187.0, 188.0],
                    "low":    [184.0, 185.5],
                    "close":  [186.5, 187.4],
                    "volume": [50_000_000.0, 42_000_000.0]
                } ] },
                "events": {
                    "dividends": { "1705500000": { "amount": 0.24, "date": 1705500000 } },
                    "splits": { "1705586400": { "date": 1705586400, "numerator": 4.0, "denominator": 1.0 } }
                }
            } ] }
        })
    }

    #[test]
    fn parses_chart_bars_in_exchange_calendar() {
        let (bars, actions) =
            parse_chart_payload(&chart_payload(), "AAPL", Interval::Daily).unwrap();
        assert_eq!(bars.len(), 2);
        // 2024-01-17 13:20 UTC is still 2024-01-17 in New York.
        assert_eq!(bars[0].trade_date, "2024-01-17");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_type, ActionType::Dividend);
        assert_eq!(actions[1].action_type, ActionType::Split);
        assert_eq!(actions[1].value, 4.0);
    }

    #[test]
    fn null_padded_sessions_are_skipped() {
        let payload = json!({
            "chart": { "result": [ {
                "timestamp": [1705500000, 1705586400],
                "indicators": { "quote": [ {
                    "open":   [185.0, null],
                    "high":   [187.0, null],
                    "low":    [184.0, null],
                    "close":  [186.5, null],
                    "volume": [50_000_000.0, null]
                } ] }
            } ] }
        });
        let (bars, _) = parse_chart_payload(&payload, "AAPL", Interval::Daily).unwrap();
        assert_eq!(bars.len(), 1);
    }

    #[test]
    fn missing_result_is_malformed() {
        let payload = json!({"chart": {"result": null}});
        assert!(matches!(
            parse_chart_payload(&payload, "AAPL", Interval::Daily),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn quote_summary_maps_ratios() {
        let payload = json!({
            "quoteSummary": { "result": [ {
                "summaryDetail": {
                    "marketCap": { "raw": 2.9e12 },
                    "trailingPE": { "raw": 29.8 },
                    "dividendYield": { "raw": 0.0052 }
                },
                "defaultKeyStatistics": { "priceToBook": { "raw": 45.1 } },
                "financialData": {
                    "profitMargins": { "raw": 0.253 },
                    "currentRatio": { "raw": 0.98 }
                }
            } ] }
        });
        let snap = parse_quote_summary("AAPL", &payload).unwrap();
        assert_eq!(snap.market_cap, Some(2.9e12));
        assert_eq!(snap.pe_ratio, Some(29.8));
        assert!((snap.dividend_yield.unwrap() - 0.52).abs() < 1e-9);
        assert!((snap.net_margin.unwrap() - 25.3).abs() < 1e-9);
    }

    #[test]
    fn income_history_sorted_by_year() {
        let payload = json!({
            "quoteSummary": { "result": [ {
                "incomeStatementHistory": { "incomeStatementHistory": [
                    { "endDate": { "fmt": "2023-09-30" }, "netIncome": { "raw": 9.7e10 } },
                    { "endDate": { "fmt": "2021-09-30" }, "netIncome": { "raw": 9.468e10 } },
                    { "endDate": { "fmt": "2022-09-30" }, "netIncome": { "raw": 9.98e10 } }
                ] }
            } ] }
        });
        let earnings = parse_income_history("AAPL", &payload);
        let years: Vec<i32> = earnings.iter().map(|e| e.year).collect();
        assert_eq!(years, vec![2021, 2022, 2023]);
    }

    #[test]
    fn roster_suffix_filter() {
        assert!(roster_symbol_ok("AAPL"));
        assert!(roster_symbol_ok("GOOG"));
        // Four chars or fewer always pass, even with a flagged last letter.
        assert!(roster_symbol_ok("SPOT"));
        assert!(!roster_symbol_ok("ACABW"));
        assert!(!roster_symbol_ok("BANKR"));
        assert!(!roster_symbol_ok("LEHMQ"));
        assert!(!roster_symbol_ok("PSA-P"));
        assert!(roster_symbol_ok("GOOGL"));
    }

    #[test]
    fn listing_file_parse_skips_header_and_footer() {
        let body = "Symbol|Security Name|Market Category|Test Issue\n\
                    AAPL|Apple Inc. - Common Stock|Q|N\n\
                    MSFT|Microsoft Corporation - Common Stock|Q|N\n\
                    File Creation Time: 0118202421:30|||";
        let rows = parse_listing_file(body);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "AAPL");
    }

    #[test]
    fn constituents_csv_parse() {
        let body = "Symbol,Name,Sector\nAAPL,Apple Inc.,Information Technology\nMMM,3M,Industrials";
        let rows = parse_constituents_csv(body);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], ("MMM".to_string(), "3M".to_string()));
    }
}
