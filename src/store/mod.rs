//! Persistent store gateway.
//!
//! Typed upsert and range-read operations over sqlite. Batch upserts run in
//! one transaction and roll back together; conflict handling is
//! `ON CONFLICT DO UPDATE` against each table's natural key. All calls go
//! through the blocking pool so the task runtime never stalls on disk I/O.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::{FetchError, FetchResult};
use crate::models::{
    ActionType, AnnualEarnings, CorporateAction, DailyMetrics, FundamentalSnapshot, Interval,
    Market, OhlcvRow, SymbolInfo, ValidationStatus,
};

/// Ratio filters for the daily-metrics screener. Unset bounds do not
/// constrain; ratio bounds implicitly require a positive ratio.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScreenerQuery {
    pub min_pe: Option<f64>,
    pub max_pe: Option<f64>,
    pub min_pb: Option<f64>,
    pub max_pb: Option<f64>,
    pub min_market_cap: Option<f64>,
    pub max_market_cap: Option<f64>,
    pub min_dividend_yield: Option<f64>,
    pub limit: usize,
}

impl ScreenerQuery {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

/// Gateway over the relational store. Cheap to clone via `Arc`.
#[derive(Debug)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .with_context(|| format!("failed to open store at {path}"))?;
        conn.execute_batch(schema::SCHEMA_SQL)
            .context("failed to apply store schema")?;
        info!(path, "store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(schema::SCHEMA_SQL)
            .context("failed to apply store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> FetchResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| FetchError::Internal(format!("store task join error: {e}")))?
        .map_err(FetchError::from)
    }

    // ---- OHLCV -----------------------------------------------------------

    /// Insert-or-update a batch of bars atomically. Within a batch the last
    /// write per `(symbol, interval, trade_date)` wins.
    pub async fn upsert_ohlcv(&self, rows: Vec<OhlcvRow>) -> FetchResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0usize;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO ohlcv (symbol, interval, trade_date, open, high, low, close,
                                        pre_close, change, pct_chg, volume, amount,
                                        ma5, ma10, ma20, ma60)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                     ON CONFLICT(symbol, interval, trade_date) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        pre_close = excluded.pre_close,
                        change = excluded.change,
                        pct_chg = excluded.pct_chg,
                        volume = excluded.volume,
                        amount = excluded.amount,
                        ma5 = excluded.ma5,
                        ma10 = excluded.ma10,
                        ma20 = excluded.ma20,
                        ma60 = excluded.ma60",
                )?;
                for row in &rows {
                    written += stmt.execute(params![
                        row.symbol,
                        row.interval.as_str(),
                        row.trade_date,
                        row.open,
                        row.high,
                        row.low,
                        row.close,
                        row.pre_close,
                        row.change,
                        row.pct_chg,
                        row.volume,
                        row.amount,
                        row.ma5,
                        row.ma10,
                        row.ma20,
                        row.ma60,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    /// Bars for one symbol and interval, ordered ascending by trade date.
    pub async fn read_ohlcv(
        &self,
        symbol: &str,
        interval: Interval,
        from: Option<String>,
        to: Option<String>,
    ) -> FetchResult<Vec<OhlcvRow>> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, interval, trade_date, open, high, low, close,
                        pre_close, change, pct_chg, volume, amount, ma5, ma10, ma20, ma60
                 FROM ohlcv
                 WHERE symbol = ?1 AND interval = ?2
                   AND (?3 IS NULL OR trade_date >= ?3)
                   AND (?4 IS NULL OR trade_date <= ?4)
                 ORDER BY trade_date ASC",
            )?;
            let rows = stmt
                .query_map(params![symbol, interval.as_str(), from, to], row_to_ohlcv)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Latest stored trade date for `(symbol, interval)`, if any.
    pub async fn latest_trade_date(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> FetchResult<Option<String>> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT MAX(trade_date) FROM ohlcv WHERE symbol = ?1 AND interval = ?2",
                params![symbol, interval.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
        })
        .await
    }

    // ---- Symbol list -----------------------------------------------------

    /// Upsert `(code, name)` pairs; conflict key `(ts_code, market)` updates
    /// name and refresh timestamp.
    pub async fn upsert_symbols(
        &self,
        market: Market,
        entries: Vec<(String, String)>,
    ) -> FetchResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0usize;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO symbols (ts_code, name, market, last_updated)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(ts_code, market) DO UPDATE SET
                        name = excluded.name,
                        last_updated = excluded.last_updated",
                )?;
                for (code, name) in &entries {
                    written += stmt.execute(params![code, name, market.as_str(), now])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    /// Canonical symbols for a market, sorted by code.
    pub async fn list_symbols(&self, market: Market) -> FetchResult<Vec<SymbolInfo>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ts_code, name, market, last_updated
                 FROM symbols WHERE market = ?1 ORDER BY ts_code ASC",
            )?;
            let rows = stmt
                .query_map(params![market.as_str()], |row| {
                    Ok(SymbolInfo {
                        ts_code: row.get(0)?,
                        name: row.get(1)?,
                        market: parse_market(&row.get::<_, String>(2)?)?,
                        last_updated: parse_rfc3339(&row.get::<_, String>(3)?)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn symbol_count(&self, market: Market) -> FetchResult<i64> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM symbols WHERE market = ?1",
                params![market.as_str()],
                |row| row.get(0),
            )
        })
        .await
    }

    /// Oldest refresh timestamp across a market's symbol list.
    pub async fn oldest_symbol_refresh(
        &self,
        market: Market,
    ) -> FetchResult<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT MIN(last_updated) FROM symbols WHERE market = ?1",
                    params![market.as_str()],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
    }

    // ---- Fundamentals ----------------------------------------------------

    pub async fn upsert_fundamentals(&self, snap: FundamentalSnapshot) -> FetchResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO fundamentals (symbol, market_cap, pe_ratio, pb_ratio,
                     dividend_yield, gross_margin, net_margin, revenue_growth,
                     profit_growth, debt_to_assets, current_ratio, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(symbol) DO UPDATE SET
                    market_cap = excluded.market_cap,
                    pe_ratio = excluded.pe_ratio,
                    pb_ratio = excluded.pb_ratio,
                    dividend_yield = excluded.dividend_yield,
                    gross_margin = excluded.gross_margin,
                    net_margin = excluded.net_margin,
                    revenue_growth = excluded.revenue_growth,
                    profit_growth = excluded.profit_growth,
                    debt_to_assets = excluded.debt_to_assets,
                    current_ratio = excluded.current_ratio,
                    last_updated = excluded.last_updated",
                params![
                    snap.symbol,
                    snap.market_cap,
                    snap.pe_ratio,
                    snap.pb_ratio,
                    snap.dividend_yield,
                    snap.gross_margin,
                    snap.net_margin,
                    snap.revenue_growth,
                    snap.profit_growth,
                    snap.debt_to_assets,
                    snap.current_ratio,
                    snap.last_updated.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_fundamentals(&self, symbol: &str) -> FetchResult<Option<FundamentalSnapshot>> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, market_cap, pe_ratio, pb_ratio, dividend_yield,
                        gross_margin, net_margin, revenue_growth, profit_growth,
                        debt_to_assets, current_ratio, last_updated
                 FROM fundamentals WHERE symbol = ?1",
            )?;
            let mut rows = stmt.query_map(params![symbol], |row| {
                Ok(FundamentalSnapshot {
                    symbol: row.get(0)?,
                    market_cap: row.get(1)?,
                    pe_ratio: row.get(2)?,
                    pb_ratio: row.get(3)?,
                    dividend_yield: row.get(4)?,
                    gross_margin: row.get(5)?,
                    net_margin: row.get(6)?,
                    revenue_growth: row.get(7)?,
                    profit_growth: row.get(8)?,
                    debt_to_assets: row.get(9)?,
                    current_ratio: row.get(10)?,
                    last_updated: parse_rfc3339(&row.get::<_, String>(11)?)?,
                })
            })?;
            rows.next().transpose()
        })
        .await
    }

    // ---- Corporate actions / earnings ------------------------------------

    pub async fn upsert_corporate_actions(
        &self,
        actions: Vec<CorporateAction>,
    ) -> FetchResult<usize> {
        if actions.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0usize;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO corporate_actions (symbol, ex_date, action_type, value)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(symbol, ex_date, action_type) DO UPDATE SET
                        value = excluded.value",
                )?;
                for a in &actions {
                    written += stmt.execute(params![
                        a.symbol,
                        a.ex_date.format("%Y-%m-%d").to_string(),
                        a.action_type.as_str(),
                        a.value,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    pub async fn get_corporate_actions(&self, symbol: &str) -> FetchResult<Vec<CorporateAction>> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, ex_date, action_type, value
                 FROM corporate_actions WHERE symbol = ?1 ORDER BY ex_date ASC",
            )?;
            let rows = stmt
                .query_map(params![symbol], |row| {
                    Ok(CorporateAction {
                        symbol: row.get(0)?,
                        ex_date: parse_date(&row.get::<_, String>(1)?)?,
                        action_type: parse_action(&row.get::<_, String>(2)?)?,
                        value: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn upsert_annual_earnings(
        &self,
        earnings: Vec<AnnualEarnings>,
    ) -> FetchResult<usize> {
        if earnings.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0usize;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO annual_earnings (symbol, year, net_profit)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(symbol, year) DO UPDATE SET
                        net_profit = excluded.net_profit",
                )?;
                for e in &earnings {
                    written += stmt.execute(params![e.symbol, e.year, e.net_profit])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    pub async fn get_annual_earnings(&self, symbol: &str) -> FetchResult<Vec<AnnualEarnings>> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, year, net_profit
                 FROM annual_earnings WHERE symbol = ?1 ORDER BY year ASC",
            )?;
            let rows = stmt
                .query_map(params![symbol], |row| {
                    Ok(AnnualEarnings {
                        symbol: row.get(0)?,
                        year: row.get(1)?,
                        net_profit: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- Daily metrics ---------------------------------------------------

    pub async fn upsert_daily_metrics(&self, metrics: Vec<DailyMetrics>) -> FetchResult<usize> {
        if metrics.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0usize;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO daily_metrics (code, date, market, close_price, ma5, ma20,
                         volume, pe_ratio, pb_ratio, market_cap, dividend_yield,
                         data_source, quality_score, validation_status,
                         is_duplicate, duplicate_source)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                     ON CONFLICT(code, date, market) DO UPDATE SET
                        close_price = excluded.close_price,
                        ma5 = excluded.ma5,
                        ma20 = excluded.ma20,
                        volume = excluded.volume,
                        pe_ratio = excluded.pe_ratio,
                        pb_ratio = excluded.pb_ratio,
                        market_cap = excluded.market_cap,
                        dividend_yield = excluded.dividend_yield,
                        data_source = excluded.data_source,
                        quality_score = excluded.quality_score,
                        validation_status = excluded.validation_status,
                        is_duplicate = excluded.is_duplicate,
                        duplicate_source = excluded.duplicate_source",
                )?;
                for m in &metrics {
                    written += stmt.execute(params![
                        m.code,
                        m.date.format("%Y-%m-%d").to_string(),
                        m.market.as_str(),
                        m.close_price,
                        m.ma5,
                        m.ma20,
                        m.volume,
                        m.pe_ratio,
                        m.pb_ratio,
                        m.market_cap,
                        m.dividend_yield,
                        m.data_source,
                        m.quality_score,
                        m.validation_status.as_str(),
                        m.is_duplicate as i64,
                        m.duplicate_source,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    pub async fn get_daily_metrics(
        &self,
        code: &str,
        market: Market,
        date: NaiveDate,
    ) -> FetchResult<Option<DailyMetrics>> {
        let code = code.to_string();
        let date = date.format("%Y-%m-%d").to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT code, date, market, close_price, ma5, ma20, volume, pe_ratio,
                        pb_ratio, market_cap, dividend_yield, data_source, quality_score,
                        validation_status, is_duplicate, duplicate_source
                 FROM daily_metrics WHERE code = ?1 AND date = ?2 AND market = ?3",
            )?;
            let mut rows = stmt.query_map(params![code, date, market.as_str()], row_to_metrics)?;
            rows.next().transpose()
        })
        .await
    }

    /// Flag suppressed duplicate rows instead of deleting them.
    pub async fn mark_duplicates(
        &self,
        market: Market,
        date: NaiveDate,
        kept_code: &str,
        suppressed_codes: Vec<String>,
    ) -> FetchResult<usize> {
        if suppressed_codes.is_empty() {
            return Ok(0);
        }
        let kept = kept_code.to_string();
        let date = date.format("%Y-%m-%d").to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut marked = 0usize;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE daily_metrics
                     SET is_duplicate = 1, duplicate_source = ?1
                     WHERE code = ?2 AND date = ?3 AND market = ?4",
                )?;
                for code in &suppressed_codes {
                    marked += stmt.execute(params![kept, code, date, market.as_str()])?;
                }
            }
            tx.commit()?;
            Ok(marked)
        })
        .await
    }

    /// Ratio-filtered screener over the most recent metrics date. The
    /// positive-ratio predicates line up with the partial indexes.
    pub async fn screen_daily_metrics(
        &self,
        market: Market,
        query: ScreenerQuery,
    ) -> FetchResult<Vec<DailyMetrics>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT code, date, market, close_price, ma5, ma20, volume, pe_ratio,
                        pb_ratio, market_cap, dividend_yield, data_source, quality_score,
                        validation_status, is_duplicate, duplicate_source
                 FROM daily_metrics
                 WHERE market = ?1 AND is_duplicate = 0
                   AND date = (SELECT MAX(date) FROM daily_metrics WHERE market = ?1)
                   AND (?2 IS NULL OR (pe_ratio > 0 AND pe_ratio >= ?2))
                   AND (?3 IS NULL OR (pe_ratio > 0 AND pe_ratio <= ?3))
                   AND (?4 IS NULL OR (pb_ratio > 0 AND pb_ratio >= ?4))
                   AND (?5 IS NULL OR (pb_ratio > 0 AND pb_ratio <= ?5))
                   AND (?6 IS NULL OR (market_cap > 0 AND market_cap >= ?6))
                   AND (?7 IS NULL OR (market_cap > 0 AND market_cap <= ?7))
                   AND (?8 IS NULL OR dividend_yield >= ?8)
                 ORDER BY market_cap DESC
                 LIMIT ?9",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        market.as_str(),
                        query.min_pe,
                        query.max_pe,
                        query.min_pb,
                        query.max_pb,
                        query.min_market_cap,
                        query.max_market_cap,
                        query.min_dividend_yield,
                        query.limit as i64,
                    ],
                    row_to_metrics,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Screener-activity proxy for the warm-up hot set: most traded codes on
    /// the most recent metrics date.
    pub async fn hot_codes(&self, market: Market, limit: usize) -> FetchResult<Vec<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT code FROM daily_metrics
                 WHERE market = ?1 AND is_duplicate = 0
                   AND date = (SELECT MAX(date) FROM daily_metrics WHERE market = ?1)
                 ORDER BY volume DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![market.as_str(), limit as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
        .await
    }

    // ---- Job bookkeeping -------------------------------------------------

    pub async fn job_started(&self, job: &str) -> FetchResult<()> {
        let job = job.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO job_state (job, started_at, finished_at, detail)
                 VALUES (?1, ?2, NULL, NULL)
                 ON CONFLICT(job) DO UPDATE SET started_at = excluded.started_at",
                params![job, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn job_finished(&self, job: &str, detail: Option<String>) -> FetchResult<()> {
        let job = job.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO job_state (job, started_at, finished_at, detail)
                 VALUES (?1, NULL, ?2, ?3)
                 ON CONFLICT(job) DO UPDATE SET
                    finished_at = excluded.finished_at,
                    detail = excluded.detail",
                params![job, now, detail],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn last_job_finish(&self, job: &str) -> FetchResult<Option<DateTime<Utc>>> {
        let job = job.to_string();
        let raw: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT finished_at FROM job_state WHERE job = ?1",
                    params![job],
                    |row| row.get(0),
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
            })
            .await?;
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
    }

    /// Run `PRAGMA optimize`; cheap, safe to call periodically.
    pub async fn optimize(&self) -> FetchResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA optimize;")?;
            Ok(())
        })
        .await
        .map(|()| debug!("store optimized"))
    }
}

fn row_to_ohlcv(row: &rusqlite::Row<'_>) -> rusqlite::Result<OhlcvRow> {
    Ok(OhlcvRow {
        symbol: row.get(0)?,
        interval: parse_interval(&row.get::<_, String>(1)?)?,
        trade_date: row.get(2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        pre_close: row.get(7)?,
        change: row.get(8)?,
        pct_chg: row.get(9)?,
        volume: row.get(10)?,
        amount: row.get(11)?,
        ma5: row.get(12)?,
        ma10: row.get(13)?,
        ma20: row.get(14)?,
        ma60: row.get(15)?,
    })
}

fn row_to_metrics(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyMetrics> {
    Ok(DailyMetrics {
        code: row.get(0)?,
        date: parse_date(&row.get::<_, String>(1)?)?,
        market: parse_market(&row.get::<_, String>(2)?)?,
        close_price: row.get(3)?,
        ma5: row.get(4)?,
        ma20: row.get(5)?,
        volume: row.get(6)?,
        pe_ratio: row.get(7)?,
        pb_ratio: row.get(8)?,
        market_cap: row.get(9)?,
        dividend_yield: row.get(10)?,
        data_source: row.get(11)?,
        quality_score: row.get(12)?,
        validation_status: parse_status(&row.get::<_, String>(13)?)?,
        is_duplicate: row.get::<_, i64>(14)? != 0,
        duplicate_source: row.get(15)?,
    })
}

fn decode_err(what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("bad {what}: {raw}").into(),
    )
}

fn parse_market(raw: &str) -> rusqlite::Result<Market> {
    Market::parse(raw).ok_or_else(|| decode_err("market", raw))
}

fn parse_interval(raw: &str) -> rusqlite::Result<Interval> {
    Interval::parse(raw).ok_or_else(|| decode_err("interval", raw))
}

fn parse_status(raw: &str) -> rusqlite::Result<ValidationStatus> {
    ValidationStatus::parse(raw).ok_or_else(|| decode_err("validation_status", raw))
}

fn parse_action(raw: &str) -> rusqlite::Result<ActionType> {
    ActionType::parse(raw).ok_or_else(|| decode_err("action_type", raw))
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| decode_err("date", raw))
}

fn parse_rfc3339(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| decode_err("timestamp", raw))
}
