//! Core domain types shared across the data plane.
//!
//! Everything that crosses a component boundary lives here: OHLCV rows,
//! fundamental snapshots, derived daily metrics and the market/interval
//! vocabulary. Rows are immutable once built; updates happen by upsert.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Market a symbol trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    #[serde(rename = "A_share")]
    AShare,
    #[serde(rename = "US_stock")]
    UsStock,
    #[serde(rename = "HK_stock")]
    HkStock,
    #[serde(rename = "CRYPTO")]
    Crypto,
    #[serde(rename = "FUTURES")]
    Futures,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::AShare => "A_share",
            Market::UsStock => "US_stock",
            Market::HkStock => "HK_stock",
            Market::Crypto => "CRYPTO",
            Market::Futures => "FUTURES",
        }
    }

    pub fn parse(s: &str) -> Option<Market> {
        match s {
            "A_share" => Some(Market::AShare),
            "US_stock" => Some(Market::UsStock),
            "HK_stock" => Some(Market::HkStock),
            "CRYPTO" => Some(Market::Crypto),
            "FUTURES" => Some(Market::Futures),
            _ => None,
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bar interval for OHLCV history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Minute,
    #[serde(rename = "5day")]
    FiveDay,
    Daily,
    Weekly,
    Monthly,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute => "minute",
            Interval::FiveDay => "5day",
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Interval> {
        match s {
            "minute" => Some(Interval::Minute),
            "5day" => Some(Interval::FiveDay),
            "daily" => Some(Interval::Daily),
            "weekly" => Some(Interval::Weekly),
            "monthly" => Some(Interval::Monthly),
            _ => None,
        }
    }

    /// Intraday views are always fetched live, never from store or cache.
    pub fn bypasses_cache(&self) -> bool {
        matches!(self, Interval::Minute | Interval::FiveDay)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized OHLCV bar.
///
/// Uniqueness key is `(symbol, interval, trade_date)`. `trade_date` is a
/// calendar date string `YYYY-MM-DD` for daily+ bars and an ISO instant for
/// intraday bars. Moving averages are `None` while the window is unfilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRow {
    pub symbol: String,
    pub interval: Interval,
    pub trade_date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub pre_close: Option<f64>,
    pub change: Option<f64>,
    pub pct_chg: Option<f64>,
    pub volume: f64,
    pub amount: Option<f64>,
    pub ma5: Option<f64>,
    pub ma10: Option<f64>,
    pub ma20: Option<f64>,
    pub ma60: Option<f64>,
}

impl OhlcvRow {
    /// Bar-level sanity: low ≤ open,close ≤ high and non-negative volume.
    pub fn price_shape_ok(&self) -> bool {
        self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.volume >= 0.0
    }
}

/// Point-in-time fundamental snapshot, one row per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalSnapshot {
    pub symbol: String,
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub gross_margin: Option<f64>,
    pub net_margin: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub profit_growth: Option<f64>,
    pub debt_to_assets: Option<f64>,
    pub current_ratio: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

/// Dividend or split event. Uniqueness key is the full triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporateAction {
    pub symbol: String,
    pub ex_date: NaiveDate,
    pub action_type: ActionType,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Dividend,
    Split,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Dividend => "dividend",
            ActionType::Split => "split",
        }
    }

    pub fn parse(s: &str) -> Option<ActionType> {
        match s {
            "dividend" => Some(ActionType::Dividend),
            "split" => Some(ActionType::Split),
            _ => None,
        }
    }
}

/// Annual net profit per symbol and fiscal year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualEarnings {
    pub symbol: String,
    pub year: i32,
    pub net_profit: f64,
}

/// Validation outcome recorded on derived metric rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Validated,
    Failed,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Validated => "validated",
            ValidationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ValidationStatus> {
        match s {
            "pending" => Some(ValidationStatus::Pending),
            "validated" => Some(ValidationStatus::Validated),
            "failed" => Some(ValidationStatus::Failed),
            _ => None,
        }
    }
}

/// Derived per-day metrics record. Uniqueness key `(code, date, market)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub code: String,
    pub date: NaiveDate,
    pub market: Market,
    pub close_price: Option<f64>,
    pub ma5: Option<f64>,
    pub ma20: Option<f64>,
    pub volume: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub market_cap: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub data_source: String,
    pub quality_score: f64,
    pub validation_status: ValidationStatus,
    pub is_duplicate: bool,
    pub duplicate_source: Option<String>,
}

/// Stored symbol-list row; conflict key `(ts_code, market)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub ts_code: String,
    pub name: String,
    pub market: Market,
    pub last_updated: DateTime<Utc>,
}

/// Live spot quote used by the daily-metrics refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotQuote {
    pub symbol: String,
    pub price: f64,
    pub volume: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub market_cap: Option<f64>,
    pub dividend_yield: Option<f64>,
}
