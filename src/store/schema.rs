//! Relational schema for the persistent store.
//!
//! Every uniqueness key from the data model is a database constraint, not
//! an application convention. WAL mode keeps reads concurrent with the
//! single writer.

/// Schema with optimizations for high-volume upserts and range reads.
pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS symbols (
    ts_code       TEXT NOT NULL,
    name          TEXT NOT NULL,
    market        TEXT NOT NULL,
    last_updated  TEXT NOT NULL,
    PRIMARY KEY (ts_code, market)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_symbols_market
    ON symbols(market, ts_code);

CREATE TABLE IF NOT EXISTS ohlcv (
    symbol     TEXT NOT NULL,
    interval   TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    open       REAL NOT NULL,
    high       REAL NOT NULL,
    low        REAL NOT NULL,
    close      REAL NOT NULL,
    pre_close  REAL,
    change     REAL,
    pct_chg    REAL,
    volume     REAL NOT NULL,
    amount     REAL,
    ma5        REAL,
    ma10       REAL,
    ma20       REAL,
    ma60       REAL,
    PRIMARY KEY (symbol, interval, trade_date)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS fundamentals (
    symbol          TEXT PRIMARY KEY,
    market_cap      REAL,
    pe_ratio        REAL,
    pb_ratio        REAL,
    dividend_yield  REAL,
    gross_margin    REAL,
    net_margin      REAL,
    revenue_growth  REAL,
    profit_growth   REAL,
    debt_to_assets  REAL,
    current_ratio   REAL,
    last_updated    TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS corporate_actions (
    symbol      TEXT NOT NULL,
    ex_date     TEXT NOT NULL,
    action_type TEXT NOT NULL,
    value       REAL NOT NULL,
    PRIMARY KEY (symbol, ex_date, action_type)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS annual_earnings (
    symbol     TEXT NOT NULL,
    year       INTEGER NOT NULL,
    net_profit REAL NOT NULL,
    PRIMARY KEY (symbol, year)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS daily_metrics (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    code              TEXT NOT NULL,
    date              TEXT NOT NULL,
    market            TEXT NOT NULL,
    close_price       REAL,
    ma5               REAL,
    ma20              REAL,
    volume            REAL,
    pe_ratio          REAL,
    pb_ratio          REAL,
    market_cap        REAL,
    dividend_yield    REAL,
    data_source       TEXT NOT NULL DEFAULT '',
    quality_score     REAL NOT NULL DEFAULT 1.0,
    validation_status TEXT NOT NULL DEFAULT 'pending',
    is_duplicate      INTEGER NOT NULL DEFAULT 0,
    duplicate_source  TEXT,
    UNIQUE (code, date, market)
);

CREATE INDEX IF NOT EXISTS idx_daily_metrics_date
    ON daily_metrics(date DESC, market);

-- Partial indexes for screener queries over meaningful ratios only.
CREATE INDEX IF NOT EXISTS idx_daily_metrics_pe_positive
    ON daily_metrics(pe_ratio) WHERE pe_ratio > 0;

CREATE INDEX IF NOT EXISTS idx_daily_metrics_mcap_positive
    ON daily_metrics(market_cap) WHERE market_cap > 0;

-- Warm-up bookkeeping so restarts do not double-trigger jobs.
CREATE TABLE IF NOT EXISTS job_state (
    job         TEXT PRIMARY KEY,
    started_at  TEXT,
    finished_at TEXT,
    detail      TEXT
) WITHOUT ROWID;
"#;
